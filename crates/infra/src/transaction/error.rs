use thiserror::Error;

use docflow_ai::AiError;
use docflow_core::DomainError;

use super::failpoint::FailPoint;
use super::store::StoreError;

/// Failure raised by a unit of work.
#[derive(Debug, Clone, Error)]
pub enum OperationError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Engine(#[from] AiError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("injected fault at {point} for {operation_type}")]
    InjectedFault {
        operation_type: String,
        point: FailPoint,
    },
}

impl OperationError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether a later attempt of the same job may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            OperationError::Transient(_) => true,
            OperationError::Validation(_) => false,
            OperationError::Engine(e) => e.is_transient(),
            OperationError::Store(e) => !matches!(e, StoreError::Serialization(_)),
            OperationError::InjectedFault { .. } => true,
        }
    }
}

impl From<DomainError> for OperationError {
    fn from(value: DomainError) -> Self {
        Self::Validation(value.to_string())
    }
}

/// Outcome of `execute_with_idempotency` when the operation did not commit.
#[derive(Debug, Clone, Error)]
pub enum TransactionError {
    #[error("idempotency key {key} was already used with a different payload")]
    IdempotencyConflict { key: String },

    #[error("operation for idempotency key {key} is still in progress")]
    OperationInProgress { key: String },

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error("transaction store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl TransactionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TransactionError::IdempotencyConflict { .. } => false,
            TransactionError::OperationInProgress { .. } => true,
            TransactionError::Operation(e) => e.is_retryable(),
            TransactionError::Store(e) => !matches!(e, StoreError::Serialization(_)),
            TransactionError::Serialization(_) => false,
        }
    }
}
