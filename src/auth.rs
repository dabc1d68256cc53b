use std::fmt;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::User => "USER",
            Role::Admin => "ADMIN",
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingCredentials,
    #[error("invalid token")]
    InvalidToken,
    #[error("{0} role may not perform this action")]
    Forbidden(Role),
}

/// An authenticated caller. Only `TokenAuthority` hands these out.
#[derive(Debug, Clone)]
pub struct Principal {
    subject: String,
    role: Role,
}

impl Principal {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The one place the ADMIN role is checked. Every write path in the
    /// engine takes the resulting `AdminPrincipal`.
    pub fn require_admin(self) -> Result<AdminPrincipal, AuthError> {
        match self.role {
            Role::Admin => Ok(AdminPrincipal { subject: self.subject }),
            other => Err(AuthError::Forbidden(other)),
        }
    }
}

/// Proof that the caller holds the ADMIN role.
#[derive(Debug, Clone)]
pub struct AdminPrincipal {
    subject: String,
}

impl AdminPrincipal {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self { subject: "test-admin".into() }
    }
}

/// Maps static bearer tokens to principals.
#[derive(Clone)]
pub struct TokenAuthority {
    admin_token: String,
    user_token: Option<String>,
}

impl fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("user_token", &self.user_token.as_ref().map(|_| "<set>"))
            .finish_non_exhaustive()
    }
}

impl TokenAuthority {
    pub fn new(admin_token: impl Into<String>, user_token: Option<String>) -> Self {
        Self {
            admin_token: admin_token.into(),
            user_token,
        }
    }

    pub fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
        if constant_time_eq(token.as_bytes(), self.admin_token.as_bytes()) {
            return Ok(Principal { subject: "admin".into(), role: Role::Admin });
        }
        if let Some(user) = &self.user_token
            && constant_time_eq(token.as_bytes(), user.as_bytes())
        {
            return Ok(Principal { subject: "user".into(), role: Role::User });
        }
        Err(AuthError::InvalidToken)
    }

    /// pgwire sessions log in with the admin token as password, so every
    /// accepted session acts as admin.
    pub fn sql_session(&self) -> AdminPrincipal {
        AdminPrincipal { subject: "sql".into() }
    }

    pub fn admin_token(&self) -> &str {
        &self.admin_token
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Cleartext password source for the pgwire listener: the admin token.
#[derive(Debug)]
pub struct LineupAuthSource {
    password: String,
}

impl LineupAuthSource {
    pub fn new(authority: &TokenAuthority) -> Self {
        Self {
            password: authority.admin_token().to_string(),
        }
    }
}

#[async_trait]
impl AuthSource for LineupAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority() -> TokenAuthority {
        TokenAuthority::new("s3cret", Some("visitor".into()))
    }

    #[test]
    fn admin_token_grants_admin() {
        let principal = authority().authenticate("s3cret").unwrap();
        assert_eq!(principal.role(), Role::Admin);
        assert_eq!(principal.require_admin().unwrap().subject(), "admin");
    }

    #[test]
    fn user_token_cannot_become_admin() {
        let principal = authority().authenticate("visitor").unwrap();
        assert_eq!(principal.role(), Role::User);
        assert_eq!(
            principal.require_admin().unwrap_err(),
            AuthError::Forbidden(Role::User)
        );
    }

    #[test]
    fn unknown_token_rejected() {
        assert_eq!(
            authority().authenticate("s3cre").unwrap_err(),
            AuthError::InvalidToken
        );
        let no_user = TokenAuthority::new("s3cret", None);
        assert_eq!(no_user.authenticate("").unwrap_err(), AuthError::InvalidToken);
    }

    #[test]
    fn debug_hides_tokens() {
        let rendered = format!("{:?}", authority());
        assert!(!rendered.contains("s3cret"));
        assert!(!rendered.contains("visitor"));
    }
}
