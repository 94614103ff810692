//! Simulated payment service.

use std::collections::HashMap;

use async_trait::async_trait;
use outbox::{SagaCommand, SagaReply};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;

use super::{Participant, parse_payload};
use crate::order_saga::{commands, routing};

const SERVICE: &str = "payment";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PaymentStatus {
    Completed,
    Refunded,
}

impl PaymentStatus {
    fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Refunded => "REFUNDED",
        }
    }
}

#[derive(Debug, Clone)]
struct Payment {
    order_id: String,
    amount: f64,
    status: PaymentStatus,
}

#[derive(Debug, Default)]
struct PaymentState {
    payments: HashMap<String, Payment>,
    next_id: u32,
    charge_failure: Option<String>,
    refund_failure: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChargeRequest {
    order_id: String,
    amount: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefundRequest {
    order_id: String,
    payment_id: Option<String>,
}

/// Charges and refunds orders.
#[derive(Debug, Default)]
pub struct PaymentParticipant {
    state: RwLock<PaymentState>,
}

impl PaymentParticipant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes charges fail with `reason` until cleared with `None`.
    pub async fn fail_charges(&self, reason: Option<&str>) {
        self.state.write().await.charge_failure = reason.map(str::to_string);
    }

    /// Makes refunds fail with `reason` until cleared with `None`.
    pub async fn fail_refunds(&self, reason: Option<&str>) {
        self.state.write().await.refund_failure = reason.map(str::to_string);
    }

    pub async fn payment_count(&self) -> usize {
        self.state.read().await.payments.len()
    }

    /// Total amount currently charged and not refunded.
    pub async fn captured_total(&self) -> f64 {
        self.state
            .read()
            .await
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::Completed)
            .map(|p| p.amount)
            .sum()
    }

    /// Status string of a payment, as the payment API would report it.
    pub async fn status(&self, payment_id: &str) -> Option<&'static str> {
        self.state
            .read()
            .await
            .payments
            .get(payment_id)
            .map(|p| p.status.as_str())
    }

    async fn charge(&self, command: &SagaCommand) -> SagaReply {
        let request: ChargeRequest = match parse_payload(command, SERVICE) {
            Ok(request) => request,
            Err(reply) => return reply,
        };
        let mut state = self.state.write().await;
        if let Some(reason) = state.charge_failure.clone() {
            tracing::info!(order_id = %request.order_id, %reason, "charge declined");
            return SagaReply::failure(command, SERVICE, reason);
        }
        if request.amount <= 0.0 {
            return SagaReply::failure(command, SERVICE, "INVALID_AMOUNT");
        }

        state.next_id += 1;
        let payment_id = format!("PAY-{:04}", state.next_id);
        state.payments.insert(
            payment_id.clone(),
            Payment {
                order_id: request.order_id,
                amount: request.amount,
                status: PaymentStatus::Completed,
            },
        );
        tracing::info!(%payment_id, amount = request.amount, "payment captured");
        SagaReply::success(command, SERVICE, json!({ "paymentId": payment_id }))
    }

    async fn refund(&self, command: &SagaCommand) -> SagaReply {
        let request: RefundRequest = match parse_payload(command, SERVICE) {
            Ok(request) => request,
            Err(reply) => return reply,
        };
        let mut state = self.state.write().await;
        if let Some(reason) = state.refund_failure.clone() {
            return SagaReply::failure(command, SERVICE, reason);
        }

        // Without a payment id, refund whatever was captured for the order.
        let mut refunded = Vec::new();
        for (id, payment) in state.payments.iter_mut() {
            let matches = match &request.payment_id {
                Some(payment_id) => id == payment_id,
                None => payment.order_id == request.order_id,
            };
            if matches && payment.status == PaymentStatus::Completed {
                payment.status = PaymentStatus::Refunded;
                refunded.push(id.clone());
            }
        }
        tracing::info!(order_id = %request.order_id, count = refunded.len(), "payments refunded");
        SagaReply::success(
            command,
            SERVICE,
            json!({ "paymentId": request.payment_id, "refunded": refunded }),
        )
    }
}

#[async_trait]
impl Participant for PaymentParticipant {
    fn service(&self) -> &'static str {
        SERVICE
    }

    fn routing_keys(&self) -> &'static [&'static str] {
        &[routing::PAYMENT_PROCESS, routing::PAYMENT_REFUND]
    }

    async fn handle(&self, command: &SagaCommand) -> SagaReply {
        match command.action.as_str() {
            commands::PROCESS_PAYMENT => self.charge(command).await,
            commands::REFUND_PAYMENT => self.refund(command).await,
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
    async fn test_charge_assigns_sequential_ids() {
        let payment = PaymentParticipant::new();
        let first = payment
            .handle(&command(
                commands::PROCESS_PAYMENT,
                json!({"orderId": "O1", "amount": 10.0}),
            ))
            .await;
        let second = payment
            .handle(&command(
                commands::PROCESS_PAYMENT,
                json!({"orderId": "O2", "amount": 5.5}),
            ))
            .await;

        assert_eq!(first.payload_str("paymentId"), Some("PAY-0001"));
        assert_eq!(second.payload_str("paymentId"), Some("PAY-0002"));
        assert_eq!(payment.captured_total().await, 15.5);
    }

    #[tokio::test]
    async fn test_configured_failure_declines() {
        let payment = PaymentParticipant::new();
        payment.fail_charges(Some("TIMEOUT")).await;
        let reply = payment
            .handle(&command(
                commands::PROCESS_PAYMENT,
                json!({"orderId": "O1", "amount": 10.0}),
            ))
            .await;
        assert!(!reply.success);
        assert_eq!(reply.reason.as_deref(), Some("TIMEOUT"));
        assert_eq!(payment.payment_count().await, 0);
    }

    #[tokio::test]
    async fn test_refund_by_order_without_payment_id() {
        let payment = PaymentParticipant::new();
        payment
            .handle(&command(
                commands::PROCESS_PAYMENT,
                json!({"orderId": "O1", "amount": 10.0}),
            ))
            .await;
        let reply = payment
            .handle(&command(
                commands::REFUND_PAYMENT,
                json!({"orderId": "O1", "paymentId": null}),
            ))
            .await;

        assert!(reply.success);
        assert_eq!(payment.status("PAY-0001").await, Some("REFUNDED"));
        assert_eq!(payment.captured_total().await, 0.0);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_rejected() {
        let payment = PaymentParticipant::new();
        let reply = payment
            .handle(&command(commands::PROCESS_PAYMENT, json!({"amount": "lots"})))
            .await;
        assert_eq!(reply.reason.as_deref(), Some(super::super::REASON_INVALID_COMMAND));
    }
}
