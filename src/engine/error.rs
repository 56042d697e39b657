use ulid::Ulid;

use crate::model::FormatError;
use crate::ports::StoreError;

/// Why a request collided with existing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConflictKind {
    #[error("slot taken by booking {0}")]
    SlotTaken(Ulid),
    #[error("overlaps availability rule {0}")]
    RuleOverlap(Ulid),
    #[error("user already holds future booking {0}")]
    FutureBookingExists(Ulid),
    #[error("user has a session in progress (booking {0})")]
    SessionInProgress(Ulid),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("conflict: {0}")]
    Conflict(ConflictKind),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Ulid },
    #[error("invalid state: {0}")]
    State(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::PreconditionFailed(_) => "precondition_failed",
            EngineError::Conflict(_) => "conflict",
            EngineError::NotFound { .. } => "not_found",
            EngineError::State(_) => "state",
            EngineError::Store(_) => "store",
        }
    }

    pub(crate) fn booking_not_found(id: Ulid) -> Self {
        EngineError::NotFound { entity: "booking", id }
    }

    pub(crate) fn rule_not_found(id: Ulid) -> Self {
        EngineError::NotFound {
            entity: "availability rule",
            id,
        }
    }

    /// A write of an open booking rejected by the store's overlap backstop.
    pub(crate) fn from_occupy(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(other) => EngineError::Conflict(ConflictKind::SlotTaken(other)),
            other => EngineError::Store(other),
        }
    }
}

impl From<FormatError> for EngineError {
    fn from(err: FormatError) -> Self {
        EngineError::Validation(err.to_string())
    }
}
