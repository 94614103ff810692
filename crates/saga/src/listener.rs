//! Consumes downstream replies and feeds them to the engine.

use std::sync::Arc;
use std::time::Duration;

use outbox::{Delivery, SagaReply};
use saga_store::SagaStore;
use tokio::sync::{mpsc, watch};

use crate::context::ContextPatch;
use crate::engine::SagaEngine;
use crate::error::{Result, SagaError};
use crate::idempotency::{IdempotencyGuard, RequestMeta};
use crate::lock::LockManager;

const SERVICE_NAME: &str = "saga-orchestrator";
const TRANSIENT_ATTEMPTS: u32 = 3;
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(50);

/// What happened to one reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// The mapped event advanced the saga.
    Applied,
    /// The event was processed but did not apply (stale, terminal, action failure).
    Ignored,
    /// The request id was already processed.
    Duplicate,
    /// The reply could not be mapped to a saga event.
    Dropped,
}

/// Copies correlation ids a reply carries into a context patch.
pub fn patch_from_reply(reply: &SagaReply) -> ContextPatch {
    ContextPatch {
        payment_id: reply.payload_str("paymentId").map(str::to_string),
        reservation_id: reply
            .payload_str("reservationId")
            .or_else(|| reply.payload_str("inventoryReservationId"))
            .map(str::to_string),
        shipping_id: reply
            .payload_str("shippingId")
            .or_else(|| reply.payload_str("trackingNumber"))
            .map(str::to_string),
        last_error: if reply.success {
            None
        } else {
            reply.reason.clone()
        },
    }
}

/// Maps replies to events through the idempotency guard.
pub struct ReplyListener<S: SagaStore + Clone, L: LockManager> {
    engine: Arc<SagaEngine<S, L>>,
    guard: IdempotencyGuard<S>,
}

impl<S: SagaStore + Clone, L: LockManager> ReplyListener<S, L> {
    pub fn new(engine: Arc<SagaEngine<S, L>>) -> Self {
        let guard = IdempotencyGuard::new(engine.store().clone());
        Self { engine, guard }
    }

    /// Handles one raw bus delivery.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<ReplyOutcome> {
        match serde_json::from_value::<SagaReply>(delivery.payload) {
            Ok(reply) => self.handle(reply).await,
            Err(e) => {
                tracing::warn!(routing_key = %delivery.routing_key, error = %e, "unparseable reply dropped");
                metrics::counter!("saga_replies_dropped_total").increment(1);
                Ok(ReplyOutcome::Dropped)
            }
        }
    }

    /// Handles one parsed reply.
    #[tracing::instrument(skip(self, reply), fields(saga_id = %reply.saga_id, request_id = %reply.request_id, action = %reply.action))]
    pub async fn handle(&self, reply: SagaReply) -> Result<ReplyOutcome> {
        if reply.request_id.trim().is_empty() {
            tracing::warn!("reply without request id dropped");
            return Ok(self.dropped());
        }
        let saga_id = reply.saga_id;
        let Some(instance) = self.engine.get(saga_id).await? else {
            tracing::warn!("reply for unknown saga dropped");
            return Ok(self.dropped());
        };
        let definition = self.engine.definition(&instance.saga_type)?;
        let Some(event) = definition.map_reply(&reply) else {
            if reply.success {
                tracing::warn!(service = %reply.service, "reply maps to no event, dropped");
            } else {
                tracing::error!(service = %reply.service, reason = ?reply.reason, "failed reply maps to no event, left for recovery");
            }
            return Ok(self.dropped());
        };

        let patch = patch_from_reply(&reply);
        let meta = RequestMeta::new(
            reply.request_id.clone(),
            SERVICE_NAME,
            format!("handle-{}-reply", reply.service),
        )
        .for_saga(saga_id);

        let engine = &self.engine;
        let outcome = self
            .guard
            .execute_if_new(meta, || async move {
                match engine.deliver(saga_id, &event, patch).await {
                    Ok(accepted) => Ok(accepted.then_some(event)),
                    Err(SagaError::TimeoutExceeded { timeout_at, .. }) => {
                        tracing::warn!(%timeout_at, "reply arrived past deadline, compensating");
                        engine.compensate(saga_id, "saga deadline exceeded").await?;
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;

        Ok(match outcome {
            Some(Some(_)) => ReplyOutcome::Applied,
            Some(None) => ReplyOutcome::Ignored,
            None => ReplyOutcome::Duplicate,
        })
    }

    fn dropped(&self) -> ReplyOutcome {
        metrics::counter!("saga_replies_dropped_total").increment(1);
        ReplyOutcome::Dropped
    }

    /// Consumes deliveries until the channel closes or shutdown is signalled.
    pub async fn run(
        &self,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!("reply listener started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                delivery = deliveries.recv() => {
                    let Some(delivery) = delivery else { break };
                    self.handle_with_retry(delivery).await;
                }
            }
        }
        tracing::info!("reply listener stopped");
    }

    async fn handle_with_retry(&self, delivery: Delivery) {
        for attempt in 1..=TRANSIENT_ATTEMPTS {
            match self.handle_delivery(delivery.clone()).await {
                Ok(_) => return,
                Err(e) if e.is_transient() && attempt < TRANSIENT_ATTEMPTS => {
                    tracing::debug!(attempt, error = %e, "transient reply failure, retrying");
                    tokio::time::sleep(TRANSIENT_BACKOFF * attempt).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "reply handling failed");
                    return;
                }
            }
        }
    }
}
