//! Message transport trait and in-memory bus.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};

use crate::{OutboxError, Result};

/// A message as seen by a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub payload: serde_json::Value,
}

/// At-least-once, topic-addressed publish.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &serde_json::Value,
    ) -> Result<()>;
}

#[derive(Default)]
struct BusState {
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Delivery>>>,
    published: Vec<Delivery>,
    failures_by_key: HashMap<String, u32>,
    fail_all: bool,
}

/// In-process bus for tests and single-node runs.
///
/// Every subscriber of an exchange receives every message published to it.
/// Failures can be injected per routing key to exercise relay retries.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    state: Arc<RwLock<BusState>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to all messages published on an exchange.
    pub async fn subscribe(&self, exchange: &str) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .write()
            .await
            .subscribers
            .entry(exchange.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Makes the next `times` publishes with this routing key fail.
    pub async fn fail_next(&self, routing_key: &str, times: u32) {
        self.state
            .write()
            .await
            .failures_by_key
            .insert(routing_key.to_string(), times);
    }

    /// Makes every publish fail until reset.
    pub async fn set_fail_all(&self, fail: bool) {
        self.state.write().await.fail_all = fail;
    }

    /// Returns every message successfully published so far.
    pub async fn published(&self) -> Vec<Delivery> {
        self.state.read().await.published.clone()
    }

    /// Returns the number of successful publishes with this routing key.
    pub async fn published_count(&self, routing_key: &str) -> usize {
        self.state
            .read()
            .await
            .published
            .iter()
            .filter(|d| d.routing_key == routing_key)
            .count()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let mut state = self.state.write().await;

        if state.fail_all {
            return Err(OutboxError::Transport("broker unavailable".to_string()));
        }
        if let Some(remaining) = state.failures_by_key.get_mut(routing_key)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(OutboxError::Transport(format!(
                "publish to {routing_key} rejected"
            )));
        }

        let delivery = Delivery {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.clone(),
        };

        if let Some(subscribers) = state.subscribers.get_mut(exchange) {
            subscribers.retain(|tx| tx.send(delivery.clone()).is_ok());
        }
        state.published.push(delivery);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_published_messages() {
        let bus = InMemoryTransport::new();
        let mut rx1 = bus.subscribe("saga.commands").await;
        let mut rx2 = bus.subscribe("saga.commands").await;
        let mut other = bus.subscribe("saga.replies").await;

        bus.publish("saga.commands", "payment.process", &serde_json::json!({"n": 1}))
            .await
            .unwrap();

        assert_eq!(rx1.recv().await.unwrap().routing_key, "payment.process");
        assert_eq!(rx2.recv().await.unwrap().payload["n"], 1);
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let bus = InMemoryTransport::new();
        bus.fail_next("payment.process", 2).await;

        let payload = serde_json::json!({});
        assert!(bus.publish("x", "payment.process", &payload).await.is_err());
        assert!(bus.publish("x", "payment.process", &payload).await.is_err());
        assert!(bus.publish("x", "payment.process", &payload).await.is_ok());
        assert!(bus.publish("x", "inventory.reserve", &payload).await.is_ok());
        assert_eq!(bus.published_count("payment.process").await, 1);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = InMemoryTransport::new();
        let rx = bus.subscribe("x").await;
        drop(rx);
        bus.publish("x", "k", &serde_json::json!({})).await.unwrap();
        assert_eq!(bus.state.read().await.subscribers["x"].len(), 0);
    }
}
