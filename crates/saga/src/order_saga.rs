//! The order fulfillment saga: payment, inventory, shipping.
//!
//! ```text
//! ORDER_CREATED ─START_SAGA─► PAYMENT_PROCESSING ─PAYMENT_SUCCESS─► PAYMENT_COMPLETED
//!      ─INVENTORY_RESERVED─► INVENTORY_RESERVED ─SHIPPING_SCHEDULED─► ORDER_COMPLETED
//! ```
//!
//! Failures walk back through COMPENSATING_SHIPPING, COMPENSATING_INVENTORY
//! and COMPENSATING_PAYMENT to COMPENSATION_COMPLETED.

use std::sync::Arc;
use std::time::Duration;

use common::SagaId;
use outbox::{SagaCommand, SagaReply};
use serde_json::json;

use crate::context::SagaContext;
use crate::definition::{
    ActionError, ActionOutput, COMPENSATE, EventId, OutboundCommand, RESUME, SagaAction,
    SagaDefinition, StateId, TerminalOutcome,
};
use crate::error::Result;
use crate::verification::Resource;

pub const ORDER_SAGA: &str = "ORDER_SAGA";

/// Deadline for a whole order saga.
pub const ORDER_SAGA_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub mod states {
    use crate::definition::StateId;

    pub const ORDER_CREATED: StateId = StateId::from_static("ORDER_CREATED");
    pub const PAYMENT_PROCESSING: StateId = StateId::from_static("PAYMENT_PROCESSING");
    pub const PAYMENT_COMPLETED: StateId = StateId::from_static("PAYMENT_COMPLETED");
    pub const INVENTORY_RESERVED: StateId = StateId::from_static("INVENTORY_RESERVED");
    pub const COMPENSATING_SHIPPING: StateId = StateId::from_static("COMPENSATING_SHIPPING");
    pub const COMPENSATING_INVENTORY: StateId = StateId::from_static("COMPENSATING_INVENTORY");
    pub const COMPENSATING_PAYMENT: StateId = StateId::from_static("COMPENSATING_PAYMENT");
    pub const ORDER_COMPLETED: StateId = StateId::from_static("ORDER_COMPLETED");
    pub const ORDER_CANCELLED: StateId = StateId::from_static("ORDER_CANCELLED");
    pub const COMPENSATION_COMPLETED: StateId = StateId::from_static("COMPENSATION_COMPLETED");
}

pub mod events {
    use crate::definition::EventId;

    pub use crate::definition::{COMPENSATE, RESUME};

    pub const START_SAGA: EventId = EventId::from_static("START_SAGA");
    pub const PAYMENT_SUCCESS: EventId = EventId::from_static("PAYMENT_SUCCESS");
    pub const PAYMENT_FAILED: EventId = EventId::from_static("PAYMENT_FAILED");
    pub const PAYMENT_TIMEOUT: EventId = EventId::from_static("PAYMENT_TIMEOUT");
    pub const INVENTORY_RESERVED: EventId = EventId::from_static("INVENTORY_RESERVED");
    pub const INVENTORY_INSUFFICIENT: EventId = EventId::from_static("INVENTORY_INSUFFICIENT");
    pub const INVENTORY_FAILED: EventId = EventId::from_static("INVENTORY_FAILED");
    pub const INVENTORY_TIMEOUT: EventId = EventId::from_static("INVENTORY_TIMEOUT");
    pub const SHIPPING_SCHEDULED: EventId = EventId::from_static("SHIPPING_SCHEDULED");
    pub const SHIPPING_FAILED: EventId = EventId::from_static("SHIPPING_FAILED");
    pub const SHIPPING_TIMEOUT: EventId = EventId::from_static("SHIPPING_TIMEOUT");
    pub const SHIPPING_COMPENSATED: EventId = EventId::from_static("SHIPPING_COMPENSATED");
    pub const INVENTORY_COMPENSATED: EventId = EventId::from_static("INVENTORY_COMPENSATED");
    pub const PAYMENT_COMPENSATED: EventId = EventId::from_static("PAYMENT_COMPENSATED");
}

/// Command action names, echoed back in replies.
pub mod commands {
    pub const PROCESS_PAYMENT: &str = "PROCESS_PAYMENT";
    pub const REFUND_PAYMENT: &str = "REFUND_PAYMENT";
    pub const RESERVE_INVENTORY: &str = "RESERVE_INVENTORY";
    pub const RELEASE_INVENTORY: &str = "RELEASE_INVENTORY";
    pub const SCHEDULE_SHIPPING: &str = "SCHEDULE_SHIPPING";
    pub const CANCEL_SHIPPING: &str = "CANCEL_SHIPPING";
}

/// Routing keys on the command exchange.
pub mod routing {
    pub const PAYMENT_PROCESS: &str = "payment.process";
    pub const PAYMENT_REFUND: &str = "payment.refund";
    pub const INVENTORY_RESERVE: &str = "inventory.reserve";
    pub const INVENTORY_RELEASE: &str = "inventory.release";
    pub const SHIPPING_SCHEDULE: &str = "shipping.schedule";
    pub const SHIPPING_CANCEL: &str = "shipping.cancel";
}

/// Reply reason for a stock shortfall.
pub const REASON_INSUFFICIENT: &str = "INSUFFICIENT";
/// Reply reason for a downstream timeout.
pub const REASON_TIMEOUT: &str = "TIMEOUT";

type PayloadBuilder = fn(&SagaContext) -> std::result::Result<serde_json::Value, String>;

/// Action that stages one command for a downstream service.
///
/// The request id is minted on first use and reused on every re-issue so
/// the receiver can deduplicate.
pub struct CommandAction {
    name: &'static str,
    routing_key: &'static str,
    payload: PayloadBuilder,
}

impl SagaAction for CommandAction {
    fn name(&self) -> &'static str {
        self.name
    }

    fn execute(
        &self,
        saga_id: SagaId,
        context: &mut SagaContext,
    ) -> std::result::Result<ActionOutput, ActionError> {
        let payload = (self.payload)(context).map_err(|reason| ActionError {
            action: self.name,
            reason,
        })?;
        let request_id = context.request_id_for(self.name);
        Ok(ActionOutput {
            result: json!({ "command": self.name, "requestId": request_id }),
            commands: vec![OutboundCommand {
                routing_key: self.routing_key.to_string(),
                command: SagaCommand::new(saga_id, request_id, self.name, payload),
            }],
        })
    }
}

fn order_id(context: &SagaContext) -> std::result::Result<&str, String> {
    context
        .order_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| "orderId is missing".to_string())
}

fn process_payment_payload(context: &SagaContext) -> std::result::Result<serde_json::Value, String> {
    let amount = context
        .amount
        .filter(|a| *a > 0.0)
        .ok_or_else(|| "amount must be positive".to_string())?;
    Ok(json!({
        "orderId": order_id(context)?,
        "userId": context.user_id,
        "amount": amount,
    }))
}

fn refund_payment_payload(context: &SagaContext) -> std::result::Result<serde_json::Value, String> {
    Ok(json!({
        "orderId": order_id(context)?,
        "userId": context.user_id,
        "paymentId": context.payment_id,
        "amount": context.amount,
    }))
}

fn reserve_inventory_payload(
    context: &SagaContext,
) -> std::result::Result<serde_json::Value, String> {
    Ok(json!({
        "orderId": order_id(context)?,
        "products": context.products,
    }))
}

fn release_inventory_payload(
    context: &SagaContext,
) -> std::result::Result<serde_json::Value, String> {
    Ok(json!({
        "orderId": order_id(context)?,
        "reservationId": context.reservation_id,
        "products": context.products,
    }))
}

fn schedule_shipping_payload(
    context: &SagaContext,
) -> std::result::Result<serde_json::Value, String> {
    let reservation_id = context
        .reservation_id
        .as_deref()
        .ok_or_else(|| "no inventory reservation to ship".to_string())?;
    Ok(json!({
        "orderId": order_id(context)?,
        "userId": context.user_id,
        "reservationId": reservation_id,
        "products": context.products,
    }))
}

fn cancel_shipping_payload(context: &SagaContext) -> std::result::Result<serde_json::Value, String> {
    Ok(json!({
        "orderId": order_id(context)?,
        "shippingId": context.shipping_id,
    }))
}

fn command(
    name: &'static str,
    routing_key: &'static str,
    payload: PayloadBuilder,
) -> Arc<dyn SagaAction> {
    Arc::new(CommandAction {
        name,
        routing_key,
        payload,
    })
}

/// Order contexts need an order id and a positive amount.
pub fn validate_context(context: &SagaContext) -> std::result::Result<(), String> {
    let mut problems = Vec::new();
    if order_id(context).is_err() {
        problems.push("orderId is required");
    }
    match context.amount {
        Some(amount) if amount > 0.0 && amount.is_finite() => {}
        Some(_) => problems.push("amount must be positive"),
        None => problems.push("amount is required"),
    }
    if context.products.values().any(|q| *q == 0) {
        problems.push("product quantities must be positive");
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems.join(", "))
    }
}

/// Maps a downstream reply to an order saga event.
///
/// Failed compensation replies map to nothing; recovery retries them.
pub fn map_reply(reply: &SagaReply) -> Option<EventId> {
    let reason = reply.reason.as_deref();
    let event = match (reply.action.as_str(), reply.success) {
        (commands::PROCESS_PAYMENT, true) => events::PAYMENT_SUCCESS,
        (commands::PROCESS_PAYMENT, false) if reason == Some(REASON_TIMEOUT) => {
            events::PAYMENT_TIMEOUT
        }
        (commands::PROCESS_PAYMENT, false) => events::PAYMENT_FAILED,
        (commands::RESERVE_INVENTORY, true) => events::INVENTORY_RESERVED,
        (commands::RESERVE_INVENTORY, false) => match reason {
            Some(REASON_INSUFFICIENT) => events::INVENTORY_INSUFFICIENT,
            Some(REASON_TIMEOUT) => events::INVENTORY_TIMEOUT,
            _ => events::INVENTORY_FAILED,
        },
        (commands::SCHEDULE_SHIPPING, true) => events::SHIPPING_SCHEDULED,
        (commands::SCHEDULE_SHIPPING, false) if reason == Some(REASON_TIMEOUT) => {
            events::SHIPPING_TIMEOUT
        }
        (commands::SCHEDULE_SHIPPING, false) => events::SHIPPING_FAILED,
        (commands::REFUND_PAYMENT, true) => events::PAYMENT_COMPENSATED,
        (commands::RELEASE_INVENTORY, true) => events::INVENTORY_COMPENSATED,
        (commands::CANCEL_SHIPPING, true) => events::SHIPPING_COMPENSATED,
        _ => return None,
    };
    Some(event)
}

/// Resource to verify before resuming from `state`.
pub fn verification_target(state: &StateId, context: &SagaContext) -> Option<Resource> {
    if *state == states::PAYMENT_PROCESSING || *state == states::PAYMENT_COMPLETED {
        context.payment_id.clone().map(Resource::Payment)
    } else if *state == states::INVENTORY_RESERVED {
        context.reservation_id.clone().map(Resource::Reservation)
    } else {
        None
    }
}

/// Builds the order saga definition.
pub fn definition() -> Result<SagaDefinition> {
    definition_with_timeout(ORDER_SAGA_TIMEOUT)
}

/// Builds the order saga with a custom deadline.
pub fn definition_with_timeout(timeout: Duration) -> Result<SagaDefinition> {
    use commands::*;
    use routing::*;
    use states::*;

    let process_payment = command(PROCESS_PAYMENT, PAYMENT_PROCESS, process_payment_payload);
    let refund_payment = command(REFUND_PAYMENT, PAYMENT_REFUND, refund_payment_payload);
    let reserve_inventory = command(
        RESERVE_INVENTORY,
        INVENTORY_RESERVE,
        reserve_inventory_payload,
    );
    let release_inventory = command(
        RELEASE_INVENTORY,
        INVENTORY_RELEASE,
        release_inventory_payload,
    );
    let schedule_shipping = command(
        SCHEDULE_SHIPPING,
        SHIPPING_SCHEDULE,
        schedule_shipping_payload,
    );
    let cancel_shipping = command(CANCEL_SHIPPING, SHIPPING_CANCEL, cancel_shipping_payload);

    SagaDefinition::builder(ORDER_SAGA)
        .initial_state(ORDER_CREATED)
        .start_event(events::START_SAGA)
        .timeout(timeout)
        .validator(validate_context)
        .reply_mapper(map_reply)
        .verification_target(verification_target)
        .terminal(ORDER_COMPLETED, TerminalOutcome::Completed)
        .terminal(ORDER_CANCELLED, TerminalOutcome::Failed)
        .terminal(COMPENSATION_COMPLETED, TerminalOutcome::Failed)
        // ORDER_CREATED
        .action_transition(
            ORDER_CREATED,
            events::START_SAGA,
            PAYMENT_PROCESSING,
            process_payment.clone(),
        )
        .action_transition(
            ORDER_CREATED,
            RESUME,
            PAYMENT_PROCESSING,
            process_payment.clone(),
        )
        .compensation(ORDER_CREATED, COMPENSATE, ORDER_CANCELLED, None)
        // PAYMENT_PROCESSING
        .action_transition(
            PAYMENT_PROCESSING,
            events::PAYMENT_SUCCESS,
            PAYMENT_COMPLETED,
            reserve_inventory.clone(),
        )
        .transition(PAYMENT_PROCESSING, events::PAYMENT_FAILED, ORDER_CANCELLED)
        .transition(PAYMENT_PROCESSING, events::PAYMENT_TIMEOUT, ORDER_CANCELLED)
        .action_transition(
            PAYMENT_PROCESSING,
            RESUME,
            PAYMENT_PROCESSING,
            process_payment,
        )
        .compensation(
            PAYMENT_PROCESSING,
            COMPENSATE,
            COMPENSATING_PAYMENT,
            Some(refund_payment.clone()),
        )
        // PAYMENT_COMPLETED
        .action_transition(
            PAYMENT_COMPLETED,
            events::INVENTORY_RESERVED,
            INVENTORY_RESERVED,
            schedule_shipping.clone(),
        )
        .compensation(
            PAYMENT_COMPLETED,
            events::INVENTORY_INSUFFICIENT,
            COMPENSATING_PAYMENT,
            Some(refund_payment.clone()),
        )
        .compensation(
            PAYMENT_COMPLETED,
            events::INVENTORY_FAILED,
            COMPENSATING_PAYMENT,
            Some(refund_payment.clone()),
        )
        .compensation(
            PAYMENT_COMPLETED,
            events::INVENTORY_TIMEOUT,
            COMPENSATING_PAYMENT,
            Some(refund_payment.clone()),
        )
        .action_transition(
            PAYMENT_COMPLETED,
            RESUME,
            PAYMENT_COMPLETED,
            reserve_inventory,
        )
        .compensation(
            PAYMENT_COMPLETED,
            COMPENSATE,
            COMPENSATING_INVENTORY,
            Some(release_inventory.clone()),
        )
        // INVENTORY_RESERVED
        .transition(
            INVENTORY_RESERVED,
            events::SHIPPING_SCHEDULED,
            ORDER_COMPLETED,
        )
        .compensation(
            INVENTORY_RESERVED,
            events::SHIPPING_FAILED,
            COMPENSATING_INVENTORY,
            Some(release_inventory.clone()),
        )
        .compensation(
            INVENTORY_RESERVED,
            events::SHIPPING_TIMEOUT,
            COMPENSATING_INVENTORY,
            Some(release_inventory.clone()),
        )
        .action_transition(
            INVENTORY_RESERVED,
            RESUME,
            INVENTORY_RESERVED,
            schedule_shipping,
        )
        .compensation(
            INVENTORY_RESERVED,
            COMPENSATE,
            COMPENSATING_SHIPPING,
            Some(cancel_shipping.clone()),
        )
        // Compensation chain
        .compensation(
            COMPENSATING_SHIPPING,
            events::SHIPPING_COMPENSATED,
            COMPENSATING_INVENTORY,
            Some(release_inventory.clone()),
        )
        .compensation(
            COMPENSATING_SHIPPING,
            RESUME,
            COMPENSATING_SHIPPING,
            Some(cancel_shipping),
        )
        .compensation(
            COMPENSATING_INVENTORY,
            events::INVENTORY_COMPENSATED,
            COMPENSATING_PAYMENT,
            Some(refund_payment.clone()),
        )
        .compensation(
            COMPENSATING_INVENTORY,
            RESUME,
            COMPENSATING_INVENTORY,
            Some(release_inventory),
        )
        .compensation(
            COMPENSATING_PAYMENT,
            events::PAYMENT_COMPENSATED,
            COMPENSATION_COMPLETED,
            None,
        )
        .compensation(
            COMPENSATING_PAYMENT,
            RESUME,
            COMPENSATING_PAYMENT,
            Some(refund_payment),
        )
        .build()
}
