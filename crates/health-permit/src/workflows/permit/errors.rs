use serde::Serialize;

use super::authorization::AccessDenied;
use super::repository::RepositoryError;

/// Caller-facing classification of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthenticated,
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Conflict,
    Storage,
}

impl ErrorKind {
    pub const fn label(self) -> &'static str {
        match self {
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Storage => "storage",
        }
    }
}

/// Error raised by the permit review service.
///
/// Every variant except [`ReviewError::Storage`] is recoverable by the caller: retry with
/// corrected input, request elevated access, or re-fetch current state.
#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error(transparent)]
    Access(#[from] AccessDenied),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Storage(#[from] RepositoryError),
}

impl ReviewError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ReviewError::Access(AccessDenied::Unauthenticated) => ErrorKind::Unauthenticated,
            ReviewError::Access(AccessDenied::Unauthorized { .. }) => ErrorKind::Unauthorized,
            ReviewError::Access(AccessDenied::Forbidden { .. }) => ErrorKind::Forbidden,
            ReviewError::NotFound { .. } => ErrorKind::NotFound,
            ReviewError::Validation(_) => ErrorKind::Validation,
            ReviewError::Conflict(_) => ErrorKind::Conflict,
            ReviewError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Only storage failures should abort a batch such as the deadline sweep.
    pub fn is_fatal_for_batch(&self) -> bool {
        matches!(self, ReviewError::Storage(_))
    }
}
