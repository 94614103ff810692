//! Simulated inventory service.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use outbox::{SagaCommand, SagaReply};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;

use super::{Participant, parse_payload};
use crate::order_saga::{REASON_INSUFFICIENT, commands, routing};

const SERVICE: &str = "inventory";

#[derive(Debug, Clone)]
struct Reservation {
    order_id: String,
    items: BTreeMap<String, u32>,
    released: bool,
}

#[derive(Debug, Default)]
struct InventoryState {
    /// Products absent from the map are not stock-tracked.
    stock: HashMap<String, u32>,
    reservations: HashMap<String, Reservation>,
    next_id: u32,
    reserve_failure: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReserveRequest {
    order_id: String,
    #[serde(default)]
    products: BTreeMap<String, u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseRequest {
    order_id: String,
    reservation_id: Option<String>,
}

/// Reserves and releases stock.
#[derive(Debug, Default)]
pub struct InventoryParticipant {
    state: RwLock<InventoryState>,
}

impl InventoryParticipant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks stock for a product; reservations beyond it fail as insufficient.
    pub async fn set_stock(&self, product_id: &str, quantity: u32) {
        self.state
            .write()
            .await
            .stock
            .insert(product_id.to_string(), quantity);
    }

    pub async fn stock(&self, product_id: &str) -> Option<u32> {
        self.state.read().await.stock.get(product_id).copied()
    }

    /// Makes reservations fail with `reason` until cleared with `None`.
    pub async fn fail_reservations(&self, reason: Option<&str>) {
        self.state.write().await.reserve_failure = reason.map(str::to_string);
    }

    /// Number of reservations not yet released.
    pub async fn active_reservations(&self) -> usize {
        self.state
            .read()
            .await
            .reservations
            .values()
            .filter(|r| !r.released)
            .count()
    }

    /// Status string of a reservation, as the inventory API would report it.
    pub async fn status(&self, reservation_id: &str) -> Option<&'static str> {
        self.state
            .read()
            .await
            .reservations
            .get(reservation_id)
            .map(|r| if r.released { "RELEASED" } else { "RESERVED" })
    }

    async fn reserve(&self, command: &SagaCommand) -> SagaReply {
        let request: ReserveRequest = match parse_payload(command, SERVICE) {
            Ok(request) => request,
            Err(reply) => return reply,
        };
        let mut state = self.state.write().await;
        if let Some(reason) = state.reserve_failure.clone() {
            return SagaReply::failure(command, SERVICE, reason);
        }

        let short = request.products.iter().find(|(product, wanted)| {
            state
                .stock
                .get(product.as_str())
                .is_some_and(|available| available < *wanted)
        });
        if let Some((product, _)) = short {
            tracing::info!(order_id = %request.order_id, %product, "insufficient stock");
            return SagaReply::failure(command, SERVICE, REASON_INSUFFICIENT);
        }

        for (product, quantity) in &request.products {
            if let Some(available) = state.stock.get_mut(product) {
                *available -= quantity;
            }
        }
        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state.reservations.insert(
            reservation_id.clone(),
            Reservation {
                order_id: request.order_id,
                items: request.products,
                released: false,
            },
        );
        tracing::info!(%reservation_id, "inventory reserved");
        SagaReply::success(command, SERVICE, json!({ "reservationId": reservation_id }))
    }

    async fn release(&self, command: &SagaCommand) -> SagaReply {
        let request: ReleaseRequest = match parse_payload(command, SERVICE) {
            Ok(request) => request,
            Err(reply) => return reply,
        };
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let mut released = Vec::new();
        for (id, reservation) in state.reservations.iter_mut() {
            let matches = match &request.reservation_id {
                Some(reservation_id) => id == reservation_id,
                None => reservation.order_id == request.order_id,
            };
            if matches && !reservation.released {
                reservation.released = true;
                for (product, quantity) in &reservation.items {
                    if let Some(available) = state.stock.get_mut(product) {
                        *available += quantity;
                    }
                }
                released.push(id.clone());
            }
        }
        tracing::info!(order_id = %request.order_id, count = released.len(), "reservations released");
        SagaReply::success(
            command,
            SERVICE,
            json!({ "reservationId": request.reservation_id, "released": released }),
        )
    }
}

#[async_trait]
impl Participant for InventoryParticipant {
    fn service(&self) -> &'static str {
        SERVICE
    }

    fn routing_keys(&self) -> &'static [&'static str] {
        &[routing::INVENTORY_RESERVE, routing::INVENTORY_RELEASE]
    }

    async fn handle(&self, command: &SagaCommand) -> SagaReply {
        match command.action.as_str() {
            commands::RESERVE_INVENTORY => self.reserve(command).await,
            commands::RELEASE_INVENTORY => self.release(command).await,
            other => SagaReply::failure(command, SERVICE, format!("unsupported action {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SagaId;

    fn command(action: &str, payload: serde_json::Value) -> SagaCommand {
        SagaCommand::new(SagaId::new(), uuid::Uuid::new_v4().to_string(), action, payload)
    }

    #[tokio::test]
    async fn test_reserve_and_release_restore_stock() {
        let inventory = InventoryParticipant::new();
        inventory.set_stock("SKU-1", 5).await;

        let reply = inventory
            .handle(&command(
                commands::RESERVE_INVENTORY,
                json!({"orderId": "O1", "products": {"SKU-1": 3}}),
            ))
            .await;
        assert_eq!(reply.payload_str("reservationId"), Some("RES-0001"));
        assert_eq!(inventory.stock("SKU-1").await, Some(2));

        let reply = inventory
            .handle(&command(
                commands::RELEASE_INVENTORY,
                json!({"orderId": "O1", "reservationId": "RES-0001"}),
            ))
            .await;
        assert!(reply.success);
        assert_eq!(inventory.stock("SKU-1").await, Some(5));
        assert_eq!(inventory.status("RES-0001").await, Some("RELEASED"));
        assert_eq!(inventory.active_reservations().await, 0);
    }

    #[tokio::test]
    async fn test_shortfall_replies_insufficient() {
        let inventory = InventoryParticipant::new();
        inventory.set_stock("SKU-1", 1).await;
        let reply = inventory
            .handle(&command(
                commands::RESERVE_INVENTORY,
                json!({"orderId": "O1", "products": {"SKU-1": 2}}),
            ))
            .await;

        assert!(!reply.success);
        assert_eq!(reply.reason.as_deref(), Some(REASON_INSUFFICIENT));
        assert_eq!(inventory.stock("SKU-1").await, Some(1));
    }

    #[tokio::test]
    async fn test_release_by_order_without_reservation_id() {
        let inventory = InventoryParticipant::new();
        inventory
            .handle(&command(
                commands::RESERVE_INVENTORY,
                json!({"orderId": "O7"}),
            ))
            .await;
        let reply = inventory
            .handle(&command(
                commands::RELEASE_INVENTORY,
                json!({"orderId": "O7", "reservationId": null}),
            ))
            .await;
        assert!(reply.success);
        assert_eq!(inventory.status("RES-0001").await, Some("RELEASED"));
    }
}
