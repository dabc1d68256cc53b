use thiserror::Error;
use ulid::Ulid;

use crate::model::{Ms, ResourceAxis, ResourceKey};

use super::conflict::Conflict;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("unknown {axis}: {id}")]
    UnknownReference { axis: ResourceAxis, id: Ulid },
    #[error("invalid interval [{start}, {end}): start must be before end")]
    InvalidSpan { start: Ms, end: Ms },
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("{0}")]
    Conflict(Conflict),
    #[error("cannot delete {0}: it still has bookings")]
    HasBookings(ResourceKey),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("booking {0} kept changing under concurrent writes, try again")]
    Contended(Ulid),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Storage failures and lost races are worth retrying; everything else is a verdict.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::WalError(_) | EngineError::Contended(_))
    }

    /// Malformed or missing input, rejected before any conflict check.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::UnknownReference { .. }
                | EngineError::InvalidSpan { .. }
                | EngineError::InvalidInput(_)
                | EngineError::LimitExceeded(_)
        )
    }
}
