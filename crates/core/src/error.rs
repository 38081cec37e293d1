//! Access error model.

use thiserror::Error;

/// Result type used across the engine and service layers.
pub type AccessResult<T> = Result<T, AccessError>;

/// Caller-facing error taxonomy.
///
/// Messages are safe to surface: `Unauthorized` never says *why* credentials
/// were rejected and `Internal` hides its detail behind an opaque message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    /// Bad credentials, invalid/expired/reused token or inactive account.
    #[error("invalid credentials")]
    Unauthorized,

    /// Authenticated but hierarchically insufficient.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Duplicate unique field, duplicate active membership, second super holder.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A referenced role/permission/organization/user does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Input rejected before touching any store.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Store I/O or serialization failure. The detail is for logs only.
    #[error("internal error")]
    Internal(String),

    /// The request was cancelled while a store call was in flight.
    #[error("request cancelled")]
    Cancelled,

    /// The request deadline elapsed while a store call was in flight.
    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

impl AccessError {
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden(reason.into())
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict(reason.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal(detail.into())
    }

    /// Credential verification must not reveal whether the principal exists.
    pub fn downgrade_not_found(self) -> Self {
        match self {
            Self::NotFound(_) => Self::Unauthorized,
            other => other,
        }
    }

    /// Stable machine-readable code for transport layers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation_error",
            Self::Internal(_) => "internal_error",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
        }
    }
}
