use std::time::Duration;

use async_trait::async_trait;

use crate::{
    Checkpoint, HistoryEntry, HistoryQuery, LockLease, MessageId, OutboxMessage, OutboxStats,
    OutboxStatus, ProcessedMessage, Result, SagaId, SagaQuery, SagaRecord, StoreError,
};

/// Everything a single accepted (or failed) transition writes.
///
/// Stores commit the whole write set in one transaction: the new instance
/// row, its checkpoint, the audit row and any staged outbox messages.
#[derive(Debug, Clone)]
pub struct TransitionWrite {
    /// The instance after the transition. `record.version` must be `expected_version + 1`.
    pub record: SagaRecord,
    /// Version the writer loaded the instance at.
    pub expected_version: i64,
    pub checkpoint: Checkpoint,
    pub history: Option<HistoryEntry>,
    pub outbox: Vec<OutboxMessage>,
}

/// Checks the internal consistency of a transition write set.
pub fn validate_transition_write(write: &TransitionWrite) -> Result<()> {
    let record = &write.record;
    if record.version != write.expected_version + 1 {
        return Err(StoreError::InvalidWrite(format!(
            "record version {} does not follow expected version {}",
            record.version, write.expected_version
        )));
    }
    if write.checkpoint.saga_id != record.id {
        return Err(StoreError::InvalidWrite(
            "checkpoint belongs to another saga".to_string(),
        ));
    }
    if write.checkpoint.sequence != record.version {
        return Err(StoreError::InvalidWrite(format!(
            "checkpoint sequence {} must equal record version {}",
            write.checkpoint.sequence, record.version
        )));
    }
    if write.checkpoint.state != record.current_state {
        return Err(StoreError::InvalidWrite(format!(
            "checkpoint state {} differs from current state {}",
            write.checkpoint.state, record.current_state
        )));
    }
    if write
        .outbox
        .iter()
        .any(|m| m.status != OutboxStatus::Pending)
    {
        return Err(StoreError::InvalidWrite(
            "staged outbox messages must be pending".to_string(),
        ));
    }
    Ok(())
}

/// Persistence for saga instances, their checkpoints and audit history.
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Persists a new instance together with its first checkpoint.
    ///
    /// Fails with `SagaExists` if the id is taken.
    async fn create(&self, record: SagaRecord, checkpoint: Checkpoint) -> Result<()>;

    /// Atomically applies a transition write set.
    ///
    /// Fails with `ConcurrencyConflict` if the stored version is not
    /// `write.expected_version`; nothing is written in that case.
    async fn commit(&self, write: TransitionWrite) -> Result<()>;

    /// Loads an instance by id.
    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaRecord>>;

    /// Loads an instance's checkpoints in sequence order.
    async fn checkpoints(&self, saga_id: SagaId) -> Result<Vec<Checkpoint>>;

    /// Selects instances matching a query.
    async fn find(&self, query: SagaQuery) -> Result<Vec<SagaRecord>>;

    /// Selects audit rows matching a query.
    async fn history(&self, query: HistoryQuery) -> Result<Vec<HistoryEntry>>;
}

/// Persistence for the transactional outbox.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Stages a message outside of a saga transition.
    async fn stage(&self, message: OutboxMessage) -> Result<()>;

    /// Claims up to `limit` pending messages, oldest first.
    ///
    /// A claimed message is invisible to other workers until `lease` elapses
    /// or its status is updated.
    async fn claim_pending(
        &self,
        worker: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage>>;

    /// Returns true if some message carrying this key is already sent.
    async fn is_key_sent(&self, idempotency_key: &str) -> Result<bool>;

    /// Marks a message as sent.
    ///
    /// Fails with `DuplicateKey` if another message with the same key got there first.
    async fn mark_sent(&self, id: MessageId) -> Result<()>;

    async fn mark_duplicate(&self, id: MessageId) -> Result<()>;

    /// Records a failed publish attempt and returns the resulting status:
    /// `Failed` once `retry_count` reaches `max_retries`, `Pending` otherwise.
    async fn record_failure(
        &self,
        id: MessageId,
        error: &str,
        max_retries: u32,
    ) -> Result<OutboxStatus>;

    async fn get_message(&self, id: MessageId) -> Result<Option<OutboxMessage>>;

    /// Lists a saga's messages in creation order.
    async fn messages_for_saga(&self, saga_id: SagaId) -> Result<Vec<OutboxMessage>>;

    async fn stats(&self) -> Result<OutboxStats>;

    /// Resets a failed message to pending with a fresh retry budget.
    ///
    /// Returns false if the message is not in `Failed`.
    async fn requeue(&self, id: MessageId) -> Result<bool>;
}

/// Persistence for the idempotency guard.
#[async_trait]
pub trait ProcessedMessageRepository: Send + Sync {
    async fn find_processed(&self, request_id: &str) -> Result<Option<ProcessedMessage>>;

    /// Inserts the record unless one exists. Returns false if it already did.
    async fn record_processed(&self, message: ProcessedMessage) -> Result<bool>;
}

/// Persistence for time-bounded lock leases.
#[async_trait]
pub trait LeaseRepository: Send + Sync {
    /// Takes the lease if it is free or expired. A live lease is never
    /// re-granted, not even to its own holder.
    async fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> Result<bool>;

    /// Releases the lease if `holder` owns it.
    async fn release(&self, key: &str, holder: &str) -> Result<bool>;

    /// Releases the lease whoever owns it, returning the removed lease.
    async fn force_release(&self, key: &str) -> Result<Option<LockLease>>;

    /// Returns the live (unexpired) lease for a key.
    async fn current_lease(&self, key: &str) -> Result<Option<LockLease>>;
}

/// A complete storage back-end for the orchestrator.
pub trait SagaStore:
    SagaRepository + OutboxRepository + ProcessedMessageRepository + LeaseRepository
{
}

impl<T> SagaStore for T where
    T: SagaRepository + OutboxRepository + ProcessedMessageRepository + LeaseRepository
{
}

pub(crate) fn lease_delta(lease: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(365))
}
