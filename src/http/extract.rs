use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use super::error::AppError;
use super::AppState;
use crate::auth::{AdminPrincipal, AuthError, Principal};
use crate::observability::AUTH_FAILURES_TOTAL;

fn bearer_token(parts: &Parts) -> Result<&str, AuthError> {
    let value = parts
        .headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingCredentials)?;
    value
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or(AuthError::InvalidToken)
}

fn rejected(err: AuthError) -> AppError {
    let reason = match err {
        AuthError::MissingCredentials => "missing",
        AuthError::InvalidToken => "invalid",
        AuthError::Forbidden(_) => "forbidden",
    };
    metrics::counter!(AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
    tracing::debug!("request rejected: {err}");
    AppError::Auth(err)
}

impl FromRequestParts<AppState> for Principal {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, AppError> {
        bearer_token(parts)
            .and_then(|token| state.authority.authenticate(token))
            .map_err(rejected)
    }
}

impl FromRequestParts<AppState> for AdminPrincipal {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, AppError> {
        Principal::from_request_parts(parts, state)
            .await?
            .require_admin()
            .map_err(rejected)
    }
}
