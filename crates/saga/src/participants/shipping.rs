//! Simulated shipping service.

use std::collections::HashMap;

use async_trait::async_trait;
use outbox::{SagaCommand, SagaReply};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;

use super::{Participant, parse_payload};
use crate::order_saga::{commands, routing};

const SERVICE: &str = "shipping";

#[derive(Debug, Clone)]
struct Shipment {
    order_id: String,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct ShippingState {
    shipments: HashMap<String, Shipment>,
    next_id: u32,
    schedule_failure: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleRequest {
    order_id: String,
    reservation_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest {
    order_id: String,
    shipping_id: Option<String>,
}

/// Schedules and cancels shipments.
#[derive(Debug, Default)]
pub struct ShippingParticipant {
    state: RwLock<ShippingState>,
}

impl ShippingParticipant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes scheduling fail with `reason` until cleared with `None`.
    pub async fn fail_scheduling(&self, reason: Option<&str>) {
        self.state.write().await.schedule_failure = reason.map(str::to_string);
    }

    pub async fn shipment_count(&self) -> usize {
        self.state.read().await.shipments.len()
    }

    /// Status string of a shipment, as the shipping API would report it.
    pub async fn status(&self, tracking_number: &str) -> Option<&'static str> {
        self.state
            .read()
            .await
            .shipments
            .get(tracking_number)
            .map(|s| if s.cancelled { "CANCELLED" } else { "SCHEDULED" })
    }

    async fn schedule(&self, command: &SagaCommand) -> SagaReply {
        let request: ScheduleRequest = match parse_payload(command, SERVICE) {
            Ok(request) => request,
            Err(reply) => return reply,
        };
        let mut state = self.state.write().await;
        if let Some(reason) = state.schedule_failure.clone() {
            return SagaReply::failure(command, SERVICE, reason);
        }

        state.next_id += 1;
        let tracking_number = format!("TRACK-{:04}", state.next_id);
        state.shipments.insert(
            tracking_number.clone(),
            Shipment {
                order_id: request.order_id,
                cancelled: false,
            },
        );
        tracing::info!(%tracking_number, reservation_id = %request.reservation_id, "shipment scheduled");
        SagaReply::success(command, SERVICE, json!({ "shippingId": tracking_number }))
    }

    async fn cancel(&self, command: &SagaCommand) -> SagaReply {
        let request: CancelRequest = match parse_payload(command, SERVICE) {
            Ok(request) => request,
            Err(reply) => return reply,
        };
        let mut state = self.state.write().await;
        let mut cancelled = 0usize;
        for (id, shipment) in state.shipments.iter_mut() {
            let matches = match &request.shipping_id {
                Some(shipping_id) => id == shipping_id,
                None => shipment.order_id == request.order_id,
            };
            if matches && !shipment.cancelled {
                shipment.cancelled = true;
                cancelled += 1;
            }
        }
        tracing::info!(order_id = %request.order_id, cancelled, "shipments cancelled");
        SagaReply::success(
            command,
            SERVICE,
            json!({ "shippingId": request.shipping_id, "cancelled": cancelled }),
        )
    }
}

#[async_trait]
impl Participant for ShippingParticipant {
    fn service(&self) -> &'static str {
        SERVICE
    }

    fn routing_keys(&self) -> &'static [&'static str] {
        &[routing::SHIPPING_SCHEDULE, routing::SHIPPING_CANCEL]
    }

    async fn handle(&self, command: &SagaCommand) -> SagaReply {
        match command.action.as_str() {
            commands::SCHEDULE_SHIPPING => self.schedule(command).await,
            commands::CANCEL_SHIPPING => self.cancel(command).await,
            other => SagaReply::failure(command, SERVICE, format!("unsupported action {other}")),
        }
    }
}
