//! Assembles engine, reply listener, recovery and scheduler for one node.

use std::sync::Arc;

use outbox::{InMemoryTransport, OutboxRelay, REPLY_EXCHANGE};
use saga_store::SagaStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::OrchestratorConfig;
use crate::definition::DefinitionRegistry;
use crate::engine::SagaEngine;
use crate::error::Result;
use crate::listener::ReplyListener;
use crate::lock::LeaseLockManager;
use crate::recovery::{RecoveryManager, RecoveryReport};
use crate::scheduler::Scheduler;
use crate::verification::StateVerifier;
use crate::{order_saga, shipping_saga};

/// Engine type used by a node: locks live in the same store as the sagas.
pub type NodeEngine<S> = SagaEngine<S, LeaseLockManager<S>>;

/// Registry holding every built-in saga type.
pub fn default_registry() -> Result<DefinitionRegistry> {
    Ok(DefinitionRegistry::new()
        .with(order_saga::definition()?)
        .with(shipping_saga::definition()?))
}

/// One orchestrator node.
pub struct Orchestrator<S, V>
where
    S: SagaStore + Clone + 'static,
    V: StateVerifier + 'static,
{
    store: S,
    bus: InMemoryTransport,
    engine: Arc<NodeEngine<S>>,
    listener: Arc<ReplyListener<S, LeaseLockManager<S>>>,
    recovery: Arc<RecoveryManager<S, LeaseLockManager<S>, V>>,
    config: OrchestratorConfig,
}

impl<S, V> Orchestrator<S, V>
where
    S: SagaStore + Clone + 'static,
    V: StateVerifier + 'static,
{
    pub fn new(
        store: S,
        bus: InMemoryTransport,
        verifier: V,
        definitions: DefinitionRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        let locks = LeaseLockManager::new(store.clone(), config.node_id.clone(), config.lock_lease);
        let engine = Arc::new(SagaEngine::new(
            store.clone(),
            locks,
            definitions,
            config.engine(),
        ));
        let listener = Arc::new(ReplyListener::new(engine.clone()));
        let recovery = Arc::new(RecoveryManager::new(
            engine.clone(),
            verifier,
            config.recovery(),
        ));
        Self {
            store,
            bus,
            engine,
            listener,
            recovery,
            config,
        }
    }

    pub fn engine(&self) -> &Arc<NodeEngine<S>> {
        &self.engine
    }

    pub fn listener(&self) -> &Arc<ReplyListener<S, LeaseLockManager<S>>> {
        &self.listener
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager<S, LeaseLockManager<S>, V>> {
        &self.recovery
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Recovers unfinished sagas, then starts the reply listener and scheduler.
    #[tracing::instrument(skip(self, shutdown), fields(node = %self.config.node_id))]
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>> {
        let report: RecoveryReport = self.recovery.recover_on_startup().await?;
        tracing::info!(
            examined = report.examined,
            resumed = report.resumed,
            compensated = report.compensated,
            escalated = report.escalated,
            "startup recovery complete"
        );

        let replies = self.bus.subscribe(REPLY_EXCHANGE).await;
        let listener = self.listener.clone();
        let listener_shutdown = shutdown.clone();
        let listener_task =
            tokio::spawn(async move { listener.run(replies, listener_shutdown).await });

        let relay = OutboxRelay::new(self.store.clone(), self.bus.clone(), self.config.relay());
        let scheduler = Scheduler::new(relay, self.recovery.clone(), self.config.scheduler());
        let scheduler_task = scheduler.spawn(shutdown);

        tracing::info!("orchestrator started");
        Ok(vec![listener_task, scheduler_task])
    }
}
