use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Transient failure of the backing service. Safe to retry.
    #[error("{service} unavailable: {reason}")]
    Unavailable {
        service: &'static str,
        reason: String,
    },

    #[error("artifact not found: {0}")]
    NotFound(String),

    /// The receipt no longer identifies an in-flight delivery (the message
    /// was acknowledged or redelivered under a new receipt).
    #[error("stale or unknown receipt: {0}")]
    InvalidReceipt(String),

    #[error("artifact {key} is corrupt: expected sha256 {expected}, found {actual}")]
    Corrupt {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("invalid artifact key: {0}")]
    InvalidKey(String),

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn unavailable(service: &'static str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            service,
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}
