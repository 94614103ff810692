//! Reliable command dispatch for the saga orchestrator.
//!
//! Commands are staged in the outbox table in the same transaction as the
//! saga state change that caused them. The [`OutboxRelay`] later claims
//! pending rows, publishes them through a [`Transport`] and records the
//! outcome, suppressing re-sends of an idempotency key that already went out.

pub mod error;
pub mod message;
pub mod relay;
pub mod transport;

pub use error::{OutboxError, Result};
pub use message::{COMMAND_EXCHANGE, REPLY_EXCHANGE, SagaCommand, SagaReply};
pub use relay::{OutboxRelay, RelayConfig, RelayReport};
pub use transport::{Delivery, InMemoryTransport, Transport};
