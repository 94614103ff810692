use saga_store::StoreError;
use thiserror::Error;

/// Errors raised while relaying or publishing messages.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// The transport refused or lost the message.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The transport did not answer within the publish timeout.
    #[error("Publish timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;
