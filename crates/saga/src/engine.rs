//! The saga engine: load, apply, commit.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common::SagaId;
use saga_store::{HistoryEntry, HistoryQuery, SagaQuery, SagaStatus, SagaStore};
use serde::Serialize;

use crate::context::{ContextPatch, SagaContext};
use crate::definition::{DefinitionRegistry, EventId, RESUME, SagaDefinition, StateId};
use crate::error::{Result, SagaError};
use crate::instance::SagaInstance;
use crate::lock::{LockManager, saga_lock_key};
use crate::machine::{self, Effects, Rejection, Step};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Written to every history row this engine produces.
    pub node_id: String,
    /// Longest wait for a saga lock.
    pub lock_wait: Duration,
    /// Bound on every storage call.
    pub store_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: "orchestrator-local".to_string(),
            lock_wait: Duration::from_secs(5),
            store_timeout: Duration::from_secs(5),
        }
    }
}

/// Aggregated view of a saga's audit trail.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaSummary {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub current_state: StateId,
    pub status: SagaStatus,
    pub total_steps: usize,
    pub total_execution_time_ms: i64,
    pub start_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    pub has_errors: bool,
    pub compensation_triggered: bool,
    pub transitions: Vec<HistoryEntry>,
}

/// Drives saga instances through their definitions.
///
/// Every mutation runs under the saga's lock and commits its instance row,
/// checkpoint, history row and staged commands in one transaction guarded
/// by the instance version.
pub struct SagaEngine<S: SagaStore, L: LockManager> {
    store: S,
    locks: L,
    definitions: DefinitionRegistry,
    config: EngineConfig,
}

impl<S: SagaStore, L: LockManager> SagaEngine<S, L> {
    pub fn new(store: S, locks: L, definitions: DefinitionRegistry, config: EngineConfig) -> Self {
        Self {
            store,
            locks,
            definitions,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn locks(&self) -> &L {
        &self.locks
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.definitions
    }

    pub fn definition(&self, saga_type: &str) -> Result<Arc<SagaDefinition>> {
        self.definitions.get(saga_type)
    }

    /// Creates a saga in its initial state.
    ///
    /// The context is validated first; an invalid context creates nothing.
    #[tracing::instrument(skip(self, context))]
    pub async fn start(&self, saga_type: &str, context: SagaContext) -> Result<SagaId> {
        let definition = self.definitions.get(saga_type)?;
        definition.validate(&context)?;

        let saga_id = SagaId::new();
        let (instance, checkpoint) =
            machine::initial_instance(&definition, saga_id, context, Utc::now());
        let record = instance.to_record()?;
        self.timed(self.store.create(record, checkpoint)).await?;

        metrics::counter!("saga_started_total", "saga_type" => saga_type.to_string()).increment(1);
        tracing::info!(%saga_id, state = %instance.current_state, "saga started");
        Ok(saga_id)
    }

    /// Starts a saga and fires its definition's start event.
    pub async fn launch(&self, saga_type: &str, context: SagaContext) -> Result<SagaId> {
        let saga_id = self.start(saga_type, context).await?;
        let definition = self.definitions.get(saga_type)?;
        if let Some(event) = definition.start_event()
            && !self.send_event(saga_id, event).await?
        {
            tracing::warn!(%saga_id, %event, "start event was not accepted");
        }
        Ok(saga_id)
    }

    /// Feeds an event to a saga.
    ///
    /// Returns false when the event does not apply (terminal saga, no
    /// transition) or when the transition's action failed. Fails with
    /// `TimeoutExceeded` past the deadline.
    pub async fn send_event(&self, saga_id: SagaId, event: &EventId) -> Result<bool> {
        self.deliver(saga_id, event, ContextPatch::default()).await
    }

    /// Feeds an event, first copying correlation ids from a reply into the context.
    #[tracing::instrument(skip(self, event, patch), fields(event = %event))]
    pub async fn deliver(
        &self,
        saga_id: SagaId,
        event: &EventId,
        patch: ContextPatch,
    ) -> Result<bool> {
        self.with_lock(saga_id, || async {
            let started = Instant::now();
            let mut instance = self.load(saga_id).await?;
            let definition = self.definitions.get(&instance.saga_type)?;
            patch.apply(&mut instance.context);

            let step = machine::apply_event(
                &definition,
                &instance,
                event,
                Utc::now(),
                &self.config.node_id,
            )?;
            let accepted = self.settle(&instance, event, step).await?;
            metrics::histogram!("saga_transition_duration_seconds")
                .record(started.elapsed().as_secs_f64());
            Ok(accepted)
        })
        .await
    }

    /// Begins compensation from the current state.
    ///
    /// A saga already compensating re-issues its pending compensation command.
    /// Returns false for a terminal saga. Fails with `CompensationFailed` if
    /// no compensation path exists or its action failed.
    #[tracing::instrument(skip(self))]
    pub async fn compensate(&self, saga_id: SagaId, reason: &str) -> Result<bool> {
        self.with_lock(saga_id, || async {
            let instance = self.load(saga_id).await?;
            let definition = self.definitions.get(&instance.saga_type)?;
            let step = machine::begin_compensation(
                &definition,
                &instance,
                reason,
                Utc::now(),
                &self.config.node_id,
            )?;
            match step {
                Step::Advanced(effects) => {
                    let state = effects.instance.current_state.clone();
                    self.commit(*effects).await?;
                    tracing::warn!(%saga_id, %state, reason, "compensation started");
                    Ok(true)
                }
                Step::ActionFailed(effects) => {
                    let error = effects.instance.error_message.clone().unwrap_or_default();
                    self.commit(*effects).await?;
                    metrics::counter!("saga_action_failures_total").increment(1);
                    Err(SagaError::CompensationFailed {
                        saga_id,
                        reason: error,
                    })
                }
                Step::Rejected(Rejection::Terminal(status)) => {
                    tracing::info!(%saga_id, %status, "saga already terminal, nothing to compensate");
                    Ok(false)
                }
                Step::Rejected(rejection) => Err(SagaError::CompensationFailed {
                    saga_id,
                    reason: format!("no compensation path: {rejection:?}"),
                }),
            }
        })
        .await
    }

    /// Moves a saga back to a state it checkpointed successfully.
    #[tracing::instrument(skip(self))]
    pub async fn restore(
        &self,
        saga_id: SagaId,
        state: &StateId,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.with_lock(saga_id, || async {
            let instance = self.load(saga_id).await?;
            let effects = machine::restore(
                &instance,
                state,
                retry_count,
                next_retry_at,
                Utc::now(),
                &self.config.node_id,
            )?;
            self.commit(effects).await
        })
        .await
    }

    /// Restores a checkpointed state and fires RESUME, all under one lock hold.
    #[tracing::instrument(skip(self))]
    pub async fn resume_from_checkpoint(
        &self,
        saga_id: SagaId,
        state: &StateId,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.with_lock(saga_id, || async {
            let instance = self.load(saga_id).await?;
            let definition = self.definitions.get(&instance.saga_type)?;
            let now = Utc::now();
            let restored = machine::restore(
                &instance,
                state,
                retry_count,
                next_retry_at,
                now,
                &self.config.node_id,
            )?;
            let snapshot = restored.instance.clone();
            self.commit(restored).await?;

            let step =
                machine::apply_event(&definition, &snapshot, &RESUME, now, &self.config.node_id)?;
            self.settle(&snapshot, &RESUME, step).await
        })
        .await
    }

    /// Marks a saga as needing an operator.
    #[tracing::instrument(skip(self))]
    pub async fn escalate(&self, saga_id: SagaId, reason: &str) -> Result<()> {
        self.with_lock(saga_id, || async {
            let instance = self.load(saga_id).await?;
            if instance.status.is_terminal() {
                tracing::info!(%saga_id, status = %instance.status, "saga already terminal, not escalating");
                return Ok(());
            }
            let effects = machine::escalate(&instance, reason, Utc::now(), &self.config.node_id)?;
            self.commit(effects).await?;
            metrics::counter!("saga_manual_intervention_total").increment(1);
            tracing::error!(%saga_id, state = %instance.current_state, reason, "saga requires manual intervention");
            Ok(())
        })
        .await
    }

    /// Loads a saga with its checkpoints.
    pub async fn get(&self, saga_id: SagaId) -> Result<Option<SagaInstance>> {
        let Some(record) = self.timed(self.store.get(saga_id)).await? else {
            return Ok(None);
        };
        let checkpoints = self.timed(self.store.checkpoints(saga_id)).await?;
        Ok(Some(SagaInstance::from_record(record, checkpoints)?))
    }

    /// Selects sagas and loads their checkpoints.
    pub async fn find(&self, query: SagaQuery) -> Result<Vec<SagaInstance>> {
        let records = self.timed(self.store.find(query)).await?;
        let mut instances = Vec::with_capacity(records.len());
        for record in records {
            let checkpoints = self.timed(self.store.checkpoints(record.id)).await?;
            instances.push(SagaInstance::from_record(record, checkpoints)?);
        }
        Ok(instances)
    }

    /// Finds sagas whose metadata has `key` = `value`.
    pub async fn find_by_metadata(&self, key: &str, value: &str) -> Result<Vec<SagaInstance>> {
        self.find(SagaQuery::new().metadata(key, value)).await
    }

    /// A saga's transitions, oldest first.
    pub async fn history(&self, saga_id: SagaId) -> Result<Vec<HistoryEntry>> {
        self.timed(self.store.history(HistoryQuery::for_saga(saga_id)))
            .await
    }

    /// Transitions of one saga type, newest first.
    pub async fn history_by_type(
        &self,
        saga_type: &str,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryEntry>> {
        let mut entries = self
            .timed(self.store.history(HistoryQuery::new().saga_type(saga_type)))
            .await?;
        entries.reverse();
        if let Some(limit) = limit.filter(|l| *l > 0) {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Every recorded `source -> target` transition, newest first.
    pub async fn history_by_transition(
        &self,
        source: &str,
        target: &str,
    ) -> Result<Vec<HistoryEntry>> {
        let mut entries = self
            .timed(
                self.store
                    .history(HistoryQuery::new().source_state(source).target_state(target)),
            )
            .await?;
        entries.reverse();
        Ok(entries)
    }

    /// Summarises a saga's audit trail.
    pub async fn summary(&self, saga_id: SagaId) -> Result<Option<SagaSummary>> {
        let Some(instance) = self.get(saga_id).await? else {
            return Ok(None);
        };
        let transitions = self.history(saga_id).await?;
        Ok(Some(SagaSummary {
            saga_id,
            saga_type: instance.saga_type,
            current_state: instance.current_state,
            status: instance.status,
            total_steps: transitions.len(),
            total_execution_time_ms: transitions.iter().map(|h| h.duration_ms).sum(),
            start_time: instance.created_at,
            last_update_time: instance.updated_at,
            has_errors: transitions.iter().any(|h| h.error.is_some()),
            compensation_triggered: instance.compensation_triggered,
            transitions,
        }))
    }

    async fn load(&self, saga_id: SagaId) -> Result<SagaInstance> {
        self.get(saga_id)
            .await?
            .ok_or(SagaError::SagaNotFound(saga_id))
    }

    async fn settle(&self, before: &SagaInstance, event: &EventId, step: Step) -> Result<bool> {
        let saga_id = before.id;
        let saga_type = before.saga_type.clone();
        match step {
            Step::Advanced(effects) => {
                let from = before.current_state.clone();
                let to = effects.instance.current_state.clone();
                let status = effects.instance.status;
                let is_compensation = effects.is_compensation;
                self.commit(*effects).await?;
                metrics::counter!("saga_events_accepted_total", "saga_type" => saga_type)
                    .increment(1);
                tracing::info!(%saga_id, %event, %from, %to, %status, is_compensation, "transition applied");
                Ok(true)
            }
            Step::ActionFailed(effects) => {
                let action = effects.action.unwrap_or("none");
                let error = effects.instance.error_message.clone();
                self.commit(*effects).await?;
                metrics::counter!("saga_action_failures_total", "saga_type" => saga_type)
                    .increment(1);
                tracing::error!(%saga_id, %event, action, error = ?error, "transition action failed");
                Ok(false)
            }
            Step::Rejected(Rejection::TimedOut(timeout_at)) => {
                metrics::counter!("saga_events_rejected_total", "reason" => "timeout").increment(1);
                tracing::warn!(%saga_id, %event, %timeout_at, "event rejected past deadline");
                Err(SagaError::TimeoutExceeded {
                    saga_id,
                    timeout_at,
                })
            }
            Step::Rejected(Rejection::Terminal(status)) => {
                metrics::counter!("saga_events_rejected_total", "reason" => "terminal")
                    .increment(1);
                tracing::info!(%saga_id, %event, %status, "event ignored for terminal saga");
                Ok(false)
            }
            Step::Rejected(Rejection::NoTransition { state, event }) => {
                metrics::counter!("saga_events_rejected_total", "reason" => "no_transition")
                    .increment(1);
                tracing::info!(%saga_id, %event, %state, "no transition for event");
                Ok(false)
            }
        }
    }

    async fn commit(&self, effects: Effects) -> Result<()> {
        self.timed(self.store.commit(effects.write)).await
    }

    async fn with_lock<T, F, Fut>(&self, saga_id: SagaId, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = saga_lock_key(saga_id);
        if !self.locks.try_lock(&key, self.config.lock_wait).await? {
            metrics::counter!("saga_lock_unavailable_total").increment(1);
            return Err(SagaError::LockUnavailable(key));
        }
        let result = work().await;
        if let Err(e) = self.locks.unlock(&key).await {
            tracing::warn!(%saga_id, error = %e, "failed to release saga lock");
        }
        result
    }

    async fn timed<T, Fut>(&self, call: Fut) -> Result<T>
    where
        Fut: Future<Output = saga_store::Result<T>>,
    {
        match tokio::time::timeout(self.config.store_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SagaError::StoreTimeout(self.config.store_timeout)),
        }
    }
}
