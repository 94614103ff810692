//! Saga error types.

use chrono::{DateTime, Utc};
use common::SagaId;
use outbox::OutboxError;
use saga_store::StoreError;
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No definition is registered for the saga type.
    #[error("Unknown saga type: {0}")]
    UnknownSagaType(String),

    /// A definition failed its consistency checks at build time.
    #[error("Invalid saga definition: {0}")]
    InvalidDefinition(String),

    /// The context is missing required fields. Nothing was created.
    #[error("Invalid context: {0}")]
    InvalidContext(String),

    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// The saga ran past its deadline and must be compensated.
    #[error("Saga {saga_id} exceeded its deadline at {timeout_at}")]
    TimeoutExceeded {
        saga_id: SagaId,
        timeout_at: DateTime<Utc>,
    },

    /// Another orchestrator holds the saga's lock.
    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),

    /// The instance changed between load and commit.
    #[error("Saga {0} was modified concurrently")]
    ConcurrencyConflict(SagaId),

    /// Compensation could not be started.
    #[error("Compensation failed for saga {saga_id}: {reason}")]
    CompensationFailed { saga_id: SagaId, reason: String },

    /// A restore target is not a recorded good checkpoint.
    #[error("Cannot restore saga {saga_id} to {state}: no good checkpoint in that state")]
    InvalidRestore { saga_id: SagaId, state: String },

    /// A storage or lock call did not finish within its bound.
    #[error("Store call timed out after {0:?}")]
    StoreTimeout(std::time::Duration),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Returns true for infrastructure failures that a redelivery may get past.
    ///
    /// The idempotency guard does not record these, so the same request can
    /// be processed again.
    pub fn is_transient(&self) -> bool {
        match self {
            SagaError::LockUnavailable(_)
            | SagaError::ConcurrencyConflict(_)
            | SagaError::StoreTimeout(_) => true,
            SagaError::Store(e) => e.is_transient(),
            SagaError::Outbox(OutboxError::Transport(_) | OutboxError::Timeout(_)) => true,
            _ => false,
        }
    }
}

impl From<StoreError> for SagaError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConcurrencyConflict { saga_id, .. } => SagaError::ConcurrencyConflict(saga_id),
            StoreError::SagaNotFound(saga_id) => SagaError::SagaNotFound(saga_id),
            other => SagaError::Store(other),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
