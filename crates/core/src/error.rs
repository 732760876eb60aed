//! Validation error model.

use thiserror::Error;

/// Result type for validation performed on inputs crossing a crate boundary.
pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic input failure (never retried).
///
/// Infrastructure concerns (I/O, storage, remote services) belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed enqueue payload).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
