use thiserror::Error;

use crate::SagaId;

/// Errors that can occur when interacting with the saga store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored version did not match the version the writer loaded.
    #[error(
        "Concurrency conflict for saga {saga_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: i64,
        actual: i64,
    },

    /// The saga instance does not exist.
    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// A saga with this id was already created.
    #[error("Saga already exists: {0}")]
    SagaExists(SagaId),

    /// Another message with the same idempotency key is already marked as sent.
    #[error("Idempotency key already sent: {0}")]
    DuplicateKey(String),

    /// The write set handed to the store is malformed.
    #[error("Invalid write: {0}")]
    InvalidWrite(String),

    /// A stored row could not be decoded.
    #[error("Invalid row: {0}")]
    InvalidRow(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true for failures a caller may retry without changing its input.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::ConcurrencyConflict { .. } | StoreError::Database(_)
        )
    }
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
