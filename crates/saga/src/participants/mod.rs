//! Simulated downstream services answering saga commands over the bus.
//!
//! Each participant owns its own in-memory state, answers the commands
//! routed to it and replies on [`REPLY_EXCHANGE`]. A [`ParticipantHost`]
//! deduplicates by request id so a re-issued command gets the original
//! reply instead of a second side effect.

pub mod inventory;
pub mod payment;
pub mod shipping;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use outbox::{
    COMMAND_EXCHANGE, Delivery, InMemoryTransport, REPLY_EXCHANGE, SagaCommand, SagaReply,
    Transport,
};
use serde::de::DeserializeOwned;
use tokio::sync::{RwLock, mpsc, watch};

use crate::verification::{Resource, StateVerifier, VerificationStatus};

pub use inventory::InventoryParticipant;
pub use payment::PaymentParticipant;
pub use shipping::ShippingParticipant;

/// Reply reason for a payload the participant cannot read.
pub const REASON_INVALID_COMMAND: &str = "INVALID_COMMAND";

/// Replies remembered per host before the oldest are evicted.
pub const DEFAULT_REPLY_CACHE_CAPACITY: usize = 10_000;

/// A downstream service reachable through the command exchange.
#[async_trait]
pub trait Participant: Send + Sync {
    /// Service name stamped on replies.
    fn service(&self) -> &'static str;

    /// Command routing keys this participant consumes.
    fn routing_keys(&self) -> &'static [&'static str];

    /// Performs the command and builds the reply.
    async fn handle(&self, command: &SagaCommand) -> SagaReply;
}

pub(crate) fn parse_payload<T: DeserializeOwned>(
    command: &SagaCommand,
    service: &str,
) -> std::result::Result<T, SagaReply> {
    serde_json::from_value(command.payload.clone()).map_err(|e| {
        tracing::warn!(action = %command.action, error = %e, "malformed command payload");
        SagaReply::failure(command, service, REASON_INVALID_COMMAND)
    })
}

/// Replies by request id, evicting the oldest entry once full.
#[derive(Debug)]
struct ReplyCache {
    capacity: usize,
    replies: HashMap<String, SagaReply>,
    order: VecDeque<String>,
}

impl ReplyCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            replies: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, request_id: &str) -> Option<&SagaReply> {
        self.replies.get(request_id)
    }

    /// Stores a reply unless one is already cached, returning the cached one.
    fn insert(&mut self, request_id: &str, reply: SagaReply) -> SagaReply {
        if let Some(existing) = self.replies.get(request_id) {
            return existing.clone();
        }
        while self.replies.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.replies.remove(&oldest);
        }
        self.order.push_back(request_id.to_string());
        self.replies.insert(request_id.to_string(), reply.clone());
        reply
    }

    fn len(&self) -> usize {
        self.replies.len()
    }
}

/// Runs a participant against the bus with request-id deduplication.
///
/// Only the most recent replies are kept; a command re-issued after its
/// reply was evicted runs again.
pub struct ParticipantHost<P: Participant, T: Transport> {
    participant: Arc<P>,
    transport: T,
    replies: RwLock<ReplyCache>,
}

impl<P: Participant, T: Transport> ParticipantHost<P, T> {
    pub fn new(participant: Arc<P>, transport: T) -> Self {
        Self::with_reply_capacity(participant, transport, DEFAULT_REPLY_CACHE_CAPACITY)
    }

    pub fn with_reply_capacity(participant: Arc<P>, transport: T, capacity: usize) -> Self {
        Self {
            participant,
            transport,
            replies: RwLock::new(ReplyCache::new(capacity)),
        }
    }

    /// Number of replies currently remembered.
    pub async fn cached_replies(&self) -> usize {
        self.replies.read().await.len()
    }

    pub fn participant(&self) -> &Arc<P> {
        &self.participant
    }

    /// Handles a command, returning the cached reply for a seen request id.
    pub async fn process(&self, command: &SagaCommand) -> SagaReply {
        if let Some(reply) = self.replies.read().await.get(&command.request_id) {
            tracing::debug!(request_id = %command.request_id, "duplicate command, replaying reply");
            metrics::counter!(
                "participant_duplicate_commands_total",
                "service" => self.participant.service()
            )
            .increment(1);
            return reply.clone();
        }

        let reply = self.participant.handle(command).await;
        self.replies
            .write()
            .await
            .insert(&command.request_id, reply)
    }

    /// Handles one bus delivery and publishes the reply.
    ///
    /// Returns false if the delivery was not addressed to this participant.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> bool {
        if !self
            .participant
            .routing_keys()
            .contains(&delivery.routing_key.as_str())
        {
            return false;
        }
        let command: SagaCommand = match serde_json::from_value(delivery.payload.clone()) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(routing_key = %delivery.routing_key, error = %e, "unparseable command dropped");
                return false;
            }
        };

        let reply = self.process(&command).await;
        let routing_key = format!("{}.reply", self.participant.service());
        let payload = match serde_json::to_value(&reply) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "reply serialization failed");
                return true;
            }
        };
        if let Err(e) = self
            .transport
            .publish(REPLY_EXCHANGE, &routing_key, &payload)
            .await
        {
            tracing::warn!(request_id = %reply.request_id, error = %e, "reply publish failed");
        }
        true
    }

    /// Consumes command deliveries until the channel closes or shutdown is signalled.
    ///
    /// `commands` must be a subscription to [`COMMAND_EXCHANGE`].
    pub async fn run(
        &self,
        mut commands: mpsc::UnboundedReceiver<Delivery>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let service = self.participant.service();
        tracing::info!(service, exchange = COMMAND_EXCHANGE, "participant started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                delivery = commands.recv() => {
                    let Some(delivery) = delivery else { break };
                    self.handle_delivery(&delivery).await;
                }
            }
        }
        tracing::info!(service, "participant stopped");
    }
}

/// The three simulated services behind one handle.
#[derive(Clone, Default)]
pub struct Participants {
    pub payment: Arc<PaymentParticipant>,
    pub inventory: Arc<InventoryParticipant>,
    pub shipping: Arc<ShippingParticipant>,
}

impl Participants {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes each participant to the command exchange and spawns it.
    pub async fn spawn(
        &self,
        bus: InMemoryTransport,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            spawn_host(self.payment.clone(), bus.clone(), shutdown.clone()).await,
            spawn_host(self.inventory.clone(), bus.clone(), shutdown.clone()).await,
            spawn_host(self.shipping.clone(), bus, shutdown).await,
        ]
    }
}

async fn spawn_host<P: Participant + 'static>(
    participant: Arc<P>,
    bus: InMemoryTransport,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let commands = bus.subscribe(COMMAND_EXCHANGE).await;
    let host = ParticipantHost::new(participant, bus);
    tokio::spawn(async move { host.run(commands, shutdown).await })
}

#[async_trait]
impl StateVerifier for Participants {
    async fn verify(&self, resource: &Resource) -> VerificationStatus {
        let status = match resource {
            Resource::Payment(id) => self.payment.status(id).await,
            Resource::Reservation(id) => self.inventory.status(id).await,
            Resource::Shipment(id) => self.shipping.status(id).await,
        };
        status
            .map(VerificationStatus::from_remote)
            .unwrap_or(VerificationStatus::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order_saga::{commands, routing};
    use common::SagaId;
    use serde_json::json;

    fn charge(request_id: &str) -> SagaCommand {
        SagaCommand::new(
            SagaId::new(),
            request_id,
            commands::PROCESS_PAYMENT,
            json!({"orderId": "O1", "amount": 100.0}),
        )
    }

    #[tokio::test]
    async fn test_duplicate_request_replays_first_reply() {
        let payment = Arc::new(PaymentParticipant::new());
        let host = ParticipantHost::new(payment.clone(), InMemoryTransport::new());
        let command = charge("req-1");

        let first = host.process(&command).await;
        let second = host.process(&command).await;
        assert_eq!(first, second);
        assert_eq!(payment.payment_count().await, 1);
    }

    #[tokio::test]
    async fn test_reply_cache_evicts_oldest() {
        let payment = Arc::new(PaymentParticipant::new());
        let host =
            ParticipantHost::with_reply_capacity(payment.clone(), InMemoryTransport::new(), 2);

        for id in ["req-a", "req-b", "req-c"] {
            host.process(&charge(id)).await;
        }
        assert_eq!(host.cached_replies().await, 2);
        assert_eq!(payment.payment_count().await, 3);

        // req-c is still remembered, req-a was evicted and runs again.
        host.process(&charge("req-c")).await;
        assert_eq!(payment.payment_count().await, 3);
        host.process(&charge("req-a")).await;
        assert_eq!(payment.payment_count().await, 4);
        assert_eq!(host.cached_replies().await, 2);
    }

    #[tokio::test]
    async fn test_delivery_publishes_reply() {
        let transport = InMemoryTransport::new();
        let mut replies = transport.subscribe(REPLY_EXCHANGE).await;
        let host = ParticipantHost::new(Arc::new(PaymentParticipant::new()), transport);

        let delivery = Delivery {
            exchange: COMMAND_EXCHANGE.to_string(),
            routing_key: routing::PAYMENT_PROCESS.to_string(),
            payload: serde_json::to_value(charge("req-2")).unwrap(),
        };
        assert!(host.handle_delivery(&delivery).await);

        let published = replies.recv().await.unwrap();
        assert_eq!(published.routing_key, "payment.reply");
        let reply: SagaReply = serde_json::from_value(published.payload).unwrap();
        assert!(reply.success);
        assert_eq!(reply.payload_str("paymentId"), Some("PAY-0001"));
    }

    #[tokio::test]
    async fn test_other_routing_keys_are_skipped() {
        let host = ParticipantHost::new(
            Arc::new(PaymentParticipant::new()),
            InMemoryTransport::new(),
        );
        let delivery = Delivery {
            exchange: COMMAND_EXCHANGE.to_string(),
            routing_key: routing::INVENTORY_RESERVE.to_string(),
            payload: json!({}),
        };
        assert!(!host.handle_delivery(&delivery).await);
    }

    #[tokio::test]
    async fn test_participants_verify_their_resources() {
        let participants = Participants::new();
        let reply = participants.payment.handle(&charge("req-3")).await;
        let payment_id = reply.payload_str("paymentId").unwrap().to_string();

        assert_eq!(
            participants.verify(&Resource::Payment(payment_id)).await,
            VerificationStatus::Confirmed
        );
        assert_eq!(
            participants
                .verify(&Resource::Reservation("RES-9999".into()))
                .await,
            VerificationStatus::Unknown
        );
    }
}
