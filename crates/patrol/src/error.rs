//! Error types for the patrol engine.
//!
//! Every business failure carries a stable code string so clients can branch
//! on it without parsing messages.

use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;
use crate::types::ScanEvent;

/// Error taxonomy used to pick a transport status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Forbidden,
    Internal,
}

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum PatrolError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Business conflict with its own stable code (`IN_USE`, `ALERT_CLOSED`, ...)
    #[error("{message}")]
    Conflict { code: &'static str, message: String },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("checkpoint {0} is unknown or inactive")]
    UnknownCheckpoint(String),

    #[error("shift {0} does not exist or is not active")]
    InvalidShift(Uuid),

    #[error("checkpoint belongs to zone {checkpoint_zone}, shift runs in zone {shift_zone}")]
    ZoneMismatch {
        checkpoint_zone: Uuid,
        shift_zone: Uuid,
    },

    #[error("shift {shift_id} belongs to another guard")]
    ShiftMismatch { shift_id: Uuid },

    #[error("checkpoint already scanned within the duplicate window")]
    DuplicateScan(Box<ScanEvent>),

    #[error("guard {0} already has an active shift")]
    DuplicateActiveShift(String),

    #[error("zone {0} has no active checkpoints")]
    EmptyZone(Uuid),

    #[error("identity provider: {0}")]
    Identity(String),

    #[error("storage failure: {0}")]
    Store(#[from] StoreError),
}

impl PatrolError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::Conflict {
            code,
            message: message.into(),
        }
    }

    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict { code, .. } => *code,
            Self::Forbidden(_) => "FORBIDDEN",
            Self::UnknownCheckpoint(_) => "UNKNOWN_CHECKPOINT",
            Self::InvalidShift(_) => "INVALID_SHIFT",
            Self::ZoneMismatch { .. } => "ZONE_MISMATCH",
            Self::ShiftMismatch { .. } => "SHIFT_MISMATCH",
            Self::DuplicateScan(_) => "DUPLICATE_SCAN",
            Self::DuplicateActiveShift(_) => "DUPLICATE_ACTIVE_SHIFT",
            Self::EmptyZone(_) => "EMPTY_ZONE",
            Self::Identity(_) => "IDENTITY_UNAVAILABLE",
            Self::Store(StoreError::Conflict(_)) => "CONFLICT",
            Self::Store(_) => "INTERNAL",
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_)
            | Self::UnknownCheckpoint(_)
            | Self::InvalidShift(_)
            | Self::EmptyZone(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. }
            | Self::DuplicateScan(_)
            | Self::DuplicateActiveShift(_)
            | Self::Store(StoreError::Conflict(_)) => ErrorKind::Conflict,
            Self::ZoneMismatch { .. } | Self::ShiftMismatch { .. } | Self::Forbidden(_) => {
                ErrorKind::Forbidden
            }
            Self::Identity(_) | Self::Store(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T, E = PatrolError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_kinds() {
        let err = PatrolError::ZoneMismatch {
            checkpoint_zone: Uuid::nil(),
            shift_zone: Uuid::nil(),
        };
        assert_eq!(err.code(), "ZONE_MISMATCH");
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let err = PatrolError::from(StoreError::Conflict("dup".to_string()));
        assert_eq!(err.code(), "CONFLICT");
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err = PatrolError::conflict("IN_USE", "checkpoint is referenced");
        assert_eq!(err.code(), "IN_USE");
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err = PatrolError::from(StoreError::Backend("disk full".to_string()));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
