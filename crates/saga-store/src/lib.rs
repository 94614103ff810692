//! Durable storage for the saga orchestrator.
//!
//! Holds saga instances with their append-only checkpoints and audit
//! history, the transactional outbox, processed-request records for the
//! idempotency guard, and lock leases. Two back-ends share one set of
//! traits: an in-memory store for tests and local runs, and PostgreSQL.

pub mod error;
pub mod memory;
pub mod message;
pub mod postgres;
pub mod query;
pub mod record;
pub mod store;

pub use common::{MessageId, SagaId};
pub use error::{Result, StoreError};
pub use memory::InMemorySagaStore;
pub use message::{
    LockLease, OutboxMessage, OutboxStats, OutboxStatus, ProcessedMessage, ProcessedStatus,
};
pub use postgres::PostgresSagaStore;
pub use query::{HistoryQuery, SagaQuery};
pub use record::{Checkpoint, HistoryEntry, SagaRecord, SagaStatus};
pub use store::{
    LeaseRepository, OutboxRepository, ProcessedMessageRepository, SagaRepository, SagaStore,
    TransitionWrite, validate_transition_write,
};
