use thiserror::Error;

/// Failure reported by an analysis engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AiError {
    /// The input can never succeed (unknown document, empty text, rejected payload).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The service quota was exceeded.
    #[error("rate limited by analysis service")]
    RateLimited { retry_after_ms: Option<u64> },

    /// The service could not be reached or answered with a server error.
    #[error("analysis service unavailable: {0}")]
    Unavailable(String),

    /// The model failed to produce a result for this call.
    #[error("inference failed: {0}")]
    InferenceFailed(String),

    /// The response could not be decoded.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl AiError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AiError::RateLimited { .. } | AiError::Unavailable(_) | AiError::InferenceFailed(_)
        )
    }
}
