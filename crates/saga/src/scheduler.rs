//! Background ticks: outbox relay passes and recovery sweeps.
//!
//! One task owns all due-time bookkeeping. Both loops stop when the
//! shutdown channel flips or its sender is dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use outbox::{OutboxRelay, RelayReport, Transport};
use saga_store::SagaStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::lock::LockManager;
use crate::recovery::{RecoveryManager, RecoveryReport};
use crate::verification::StateVerifier;

const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub relay_interval: Duration,
    pub recovery_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            relay_interval: Duration::from_millis(500),
            recovery_interval: Duration::from_secs(60),
        }
    }
}

pub struct Scheduler<S, T, L, V>
where
    S: SagaStore,
    T: Transport,
    L: LockManager,
    V: StateVerifier,
{
    relay: OutboxRelay<S, T>,
    recovery: Arc<RecoveryManager<S, L, V>>,
    config: SchedulerConfig,
}

impl<S, T, L, V> Scheduler<S, T, L, V>
where
    S: SagaStore + 'static,
    T: Transport + 'static,
    L: LockManager + 'static,
    V: StateVerifier + 'static,
{
    pub fn new(
        relay: OutboxRelay<S, T>,
        recovery: Arc<RecoveryManager<S, L, V>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            relay,
            recovery,
            config,
        }
    }

    /// Runs one relay pass, logging instead of failing.
    pub async fn relay_tick(&self) -> Option<RelayReport> {
        match self.relay.run_once().await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!(error = %e, "relay pass failed");
                metrics::counter!("scheduler_tick_errors_total", "task" => "relay").increment(1);
                None
            }
        }
    }

    /// Runs one recovery sweep, logging instead of failing.
    pub async fn recovery_tick(&self) -> Option<RecoveryReport> {
        match self.recovery.sweep(Utc::now()).await {
            Ok(report) => {
                if report.examined > 0 {
                    tracing::info!(
                        examined = report.examined,
                        resumed = report.resumed,
                        compensated = report.compensated,
                        escalated = report.escalated,
                        errors = report.errors,
                        "recovery sweep complete"
                    );
                }
                Some(report)
            }
            Err(e) => {
                tracing::warn!(error = %e, "recovery sweep failed");
                metrics::counter!("scheduler_tick_errors_total", "task" => "recovery")
                    .increment(1);
                None
            }
        }
    }

    /// Ticks until shutdown. The first recovery sweep waits one full interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut relay = tokio::time::interval(self.config.relay_interval.max(MIN_PERIOD));
        relay.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let recovery_period = self.config.recovery_interval.max(MIN_PERIOD);
        let mut recovery = tokio::time::interval_at(Instant::now() + recovery_period, recovery_period);
        recovery.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            relay_ms = self.config.relay_interval.as_millis() as u64,
            recovery_secs = self.config.recovery_interval.as_secs(),
            "scheduler started"
        );
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = relay.tick() => {
                    self.relay_tick().await;
                }
                _ = recovery.tick() => {
                    self.recovery_tick().await;
                }
            }
        }
        tracing::info!("scheduler stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SagaContext;
    use crate::definition::DefinitionRegistry;
    use crate::engine::{EngineConfig, SagaEngine};
    use crate::lock::LeaseLockManager;
    use crate::order_saga::{self, ORDER_SAGA, routing};
    use crate::recovery::RecoveryPolicy;
    use crate::verification::AssumeConfirmed;
    use outbox::{InMemoryTransport, RelayConfig};
    use saga_store::InMemorySagaStore;

    #[tokio::test]
    async fn test_scheduler_relays_staged_commands_until_shutdown() {
        let store = InMemorySagaStore::new();
        let bus = InMemoryTransport::new();
        let engine = Arc::new(SagaEngine::new(
            store.clone(),
            LeaseLockManager::new(store.clone(), "node-a", Duration::from_secs(30)),
            DefinitionRegistry::new().with(order_saga::definition().unwrap()),
            EngineConfig::default(),
        ));
        let recovery = Arc::new(RecoveryManager::new(
            engine.clone(),
            AssumeConfirmed,
            RecoveryPolicy::default(),
        ));
        let scheduler = Scheduler::new(
            OutboxRelay::new(store.clone(), bus.clone(), RelayConfig::default()),
            recovery,
            SchedulerConfig {
                relay_interval: Duration::from_millis(10),
                recovery_interval: Duration::from_secs(3600),
            },
        );
        let (tx, rx) = watch::channel(false);
        let handle = scheduler.spawn(rx);

        engine
            .launch(ORDER_SAGA, SagaContext::for_order("O1", 100.0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bus.published_count(routing::PAYMENT_PROCESS).await, 1);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
