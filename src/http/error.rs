//! HTTP error bodies and the status mapping of engine and auth failures.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::AuthError;
use crate::engine::EngineError;
use crate::model::ResourceAxis;

/// API error response body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiError {
    /// Stable code for programmatic handling
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Debug)]
pub enum AppError {
    Engine(EngineError),
    Auth(AuthError),
    /// Malformed body, query string or path.
    BadRequest(String),
}

impl AppError {
    fn status_and_body(&self) -> (StatusCode, ApiError) {
        match self {
            AppError::Engine(e) => engine_error(e),
            AppError::Auth(e @ AuthError::Forbidden(_)) => {
                (StatusCode::FORBIDDEN, ApiError::new("FORBIDDEN", e.to_string()))
            }
            AppError::Auth(e) => (
                StatusCode::UNAUTHORIZED,
                ApiError::new("UNAUTHORIZED", e.to_string()),
            ),
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, ApiError::new("BAD_REQUEST", msg.clone()))
            }
        }
    }
}

fn engine_error(e: &EngineError) -> (StatusCode, ApiError) {
    let message = e.to_string();
    match e {
        EngineError::Conflict(c) => {
            let code = match c.axis {
                ResourceAxis::Artist => "ARTIST_CONFLICT",
                ResourceAxis::Stage => "STAGE_CONFLICT",
            };
            (
                StatusCode::CONFLICT,
                ApiError::new(code, message).with_details(c.existing.to_string()),
            )
        }
        EngineError::NotFound(_) => (StatusCode::NOT_FOUND, ApiError::new("NOT_FOUND", message)),
        EngineError::AlreadyExists(_) => {
            (StatusCode::CONFLICT, ApiError::new("ALREADY_EXISTS", message))
        }
        EngineError::HasBookings(_) => {
            (StatusCode::CONFLICT, ApiError::new("HAS_BOOKINGS", message))
        }
        EngineError::UnknownReference { .. } => (
            StatusCode::BAD_REQUEST,
            ApiError::new("UNKNOWN_REFERENCE", message),
        ),
        EngineError::InvalidSpan { .. } => {
            (StatusCode::BAD_REQUEST, ApiError::new("INVALID_SPAN", message))
        }
        EngineError::InvalidInput(_) => {
            (StatusCode::BAD_REQUEST, ApiError::new("INVALID_INPUT", message))
        }
        EngineError::LimitExceeded(_) => {
            (StatusCode::BAD_REQUEST, ApiError::new("LIMIT_EXCEEDED", message))
        }
        EngineError::Contended(_) => (StatusCode::CONFLICT, ApiError::new("CONTENDED", message)),
        EngineError::WalError(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            ApiError::new("STORAGE_UNAVAILABLE", "booking store temporarily unavailable")
                .with_details(message),
        ),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = self.status_and_body();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!("storage failure: {}", body.details.as_deref().unwrap_or_default());
        }
        let mut response = (status, Json(body)).into_response();
        match &self {
            AppError::Engine(e) if e.is_retryable() => {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
            }
            AppError::Auth(AuthError::MissingCredentials | AuthError::InvalidToken) => {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            _ => {}
        }
        response
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        AppError::Engine(err)
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        AppError::Auth(err)
    }
}

impl From<JsonRejection> for AppError {
    fn from(err: JsonRejection) -> Self {
        AppError::BadRequest(err.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(err: QueryRejection) -> Self {
        AppError::BadRequest(err.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::engine::Conflict;
    use ulid::Ulid;

    fn status(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn verdicts_map_to_client_errors() {
        let existing = Ulid::new();
        let (code, body) = engine_error(&EngineError::Conflict(Conflict {
            axis: ResourceAxis::Stage,
            existing,
        }));
        assert_eq!(code, StatusCode::CONFLICT);
        assert_eq!(body.code, "STAGE_CONFLICT");
        assert_eq!(body.details, Some(existing.to_string()));

        assert_eq!(
            status(EngineError::InvalidSpan { start: 5, end: 5 }.into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status(EngineError::NotFound(existing).into()), StatusCode::NOT_FOUND);
    }

    #[test]
    fn storage_failures_are_retryable() {
        let response = AppError::from(EngineError::WalError("disk full".into())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }

    #[test]
    fn lost_races_are_retryable_conflicts() {
        let response = AppError::from(EngineError::Contended(Ulid::new())).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }

    #[test]
    fn auth_failures() {
        let response = AppError::from(AuthError::MissingCredentials).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
        assert_eq!(status(AuthError::Forbidden(Role::User).into()), StatusCode::FORBIDDEN);
    }
}
