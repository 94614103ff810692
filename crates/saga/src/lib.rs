//! Saga orchestration for order fulfillment.
//!
//! A saga is a long-running transaction across services that share no
//! database. Each saga type is a data-driven [`SagaDefinition`]: a table of
//! `(state, event) -> transition` entries whose actions stage commands into
//! the outbox. The [`SagaEngine`] applies events under a per-saga lock and
//! commits the new checkpoint, history row and staged commands atomically.
//!
//! Replies come back through the [`ReplyListener`], which maps them to events
//! behind the [`IdempotencyGuard`]. The [`RecoveryManager`] resumes or
//! compensates sagas left behind by crashes, stalls and deadlines.
//!
//! The order saga runs:
//! 1. Process payment
//! 2. Reserve inventory
//! 3. Schedule shipping
//!
//! If a step fails, completed steps are compensated in reverse order.

pub mod config;
pub mod context;
pub mod definition;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod instance;
pub mod listener;
pub mod lock;
pub mod machine;
pub mod orchestrator;
pub mod order_saga;
pub mod participants;
pub mod recovery;
pub mod scheduler;
pub mod shipping_saga;
pub mod verification;

pub use config::OrchestratorConfig;
pub use context::{ContextInput, ContextPatch, SagaContext};
pub use definition::{
    COMPENSATE, DefinitionRegistry, EventId, RESUME, SagaAction, SagaDefinition, StateId,
    TerminalOutcome,
};
pub use engine::{EngineConfig, SagaEngine, SagaSummary};
pub use error::{Result, SagaError};
pub use idempotency::{IdempotencyGuard, RequestMeta, ResultId};
pub use instance::{SagaInstance, replay_state};
pub use listener::{ReplyListener, ReplyOutcome};
pub use lock::{LeaseLockManager, LockInfo, LockManager, saga_lock_key};
pub use orchestrator::{NodeEngine, Orchestrator, default_registry};
pub use participants::Participants;
pub use recovery::{RecoveryDecision, RecoveryManager, RecoveryPolicy, RecoveryReport};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use verification::{
    AssumeConfirmed, HttpStateVerifier, Resource, ServiceEndpoints, StateVerifier,
    VerificationStatus,
};
