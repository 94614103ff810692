//! Last-mile shipping saga.
//!
//! Tracks a parcel from seller preparation through sorting and the local
//! warehouse to delivery. Its transitions carry no actions; carriers report
//! progress as events.

use std::time::Duration;

use crate::context::SagaContext;
use crate::definition::{COMPENSATE, RESUME, SagaDefinition, StateId, TerminalOutcome};
use crate::error::Result;

pub const SHIPPING_SAGA: &str = "SHIPPING_SAGA";

pub const SHIPPING_SAGA_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub mod states {
    use crate::definition::StateId;

    pub const SHIPPING_CREATED: StateId = StateId::from_static("SHIPPING_CREATED");
    pub const SELLER_PREPARING: StateId = StateId::from_static("SELLER_PREPARING");
    pub const SELLER_PREPARED: StateId = StateId::from_static("SELLER_PREPARED");
    pub const PICKUP_SCHEDULED: StateId = StateId::from_static("PICKUP_SCHEDULED");
    pub const PICKED_UP: StateId = StateId::from_static("PICKED_UP");
    pub const SORTING_CENTER_RECEIVED: StateId = StateId::from_static("SORTING_CENTER_RECEIVED");
    pub const SORTING_CENTER_PROCESSING: StateId =
        StateId::from_static("SORTING_CENTER_PROCESSING");
    pub const SORTING_CENTER_COMPLETED: StateId = StateId::from_static("SORTING_CENTER_COMPLETED");
    pub const LOCAL_WAREHOUSE_RECEIVED: StateId = StateId::from_static("LOCAL_WAREHOUSE_RECEIVED");
    pub const LOCAL_WAREHOUSE_PROCESSING: StateId =
        StateId::from_static("LOCAL_WAREHOUSE_PROCESSING");
    pub const LOCAL_WAREHOUSE_READY: StateId = StateId::from_static("LOCAL_WAREHOUSE_READY");
    pub const OUT_FOR_DELIVERY: StateId = StateId::from_static("OUT_FOR_DELIVERY");
    pub const DELIVERED: StateId = StateId::from_static("DELIVERED");
    pub const DELIVERY_FAILED: StateId = StateId::from_static("DELIVERY_FAILED");
    pub const RETURNING_TO_SELLER: StateId = StateId::from_static("RETURNING_TO_SELLER");
    pub const RETURNED_TO_SELLER: StateId = StateId::from_static("RETURNED_TO_SELLER");
    pub const SHIPPING_COMPLETED: StateId = StateId::from_static("SHIPPING_COMPLETED");
    pub const SHIPPING_CANCELLED: StateId = StateId::from_static("SHIPPING_CANCELLED");
    pub const SHIPPING_FAILED: StateId = StateId::from_static("SHIPPING_FAILED");
}

pub mod events {
    use crate::definition::EventId;

    pub const START_SHIPPING: EventId = EventId::from_static("START_SHIPPING");
    pub const SELLER_COMPLETED_PREPARING: EventId =
        EventId::from_static("SELLER_COMPLETED_PREPARING");
    pub const PICKUP_REQUESTED: EventId = EventId::from_static("PICKUP_REQUESTED");
    pub const PICKUP_COMPLETED: EventId = EventId::from_static("PICKUP_COMPLETED");
    pub const ARRIVED_AT_SORTING_CENTER: EventId =
        EventId::from_static("ARRIVED_AT_SORTING_CENTER");
    pub const START_SORTING: EventId = EventId::from_static("START_SORTING");
    pub const SORTING_COMPLETED: EventId = EventId::from_static("SORTING_COMPLETED");
    pub const ARRIVED_AT_LOCAL_WAREHOUSE: EventId =
        EventId::from_static("ARRIVED_AT_LOCAL_WAREHOUSE");
    pub const START_LOCAL_PROCESSING: EventId = EventId::from_static("START_LOCAL_PROCESSING");
    pub const READY_FOR_DELIVERY: EventId = EventId::from_static("READY_FOR_DELIVERY");
    pub const START_DELIVERY: EventId = EventId::from_static("START_DELIVERY");
    pub const DELIVERY_COMPLETED: EventId = EventId::from_static("DELIVERY_COMPLETED");
    pub const DELIVERY_ATTEMPT_FAILED: EventId = EventId::from_static("DELIVERY_ATTEMPT_FAILED");
    pub const COMPLETE_SHIPPING: EventId = EventId::from_static("COMPLETE_SHIPPING");
    pub const START_RETURN: EventId = EventId::from_static("START_RETURN");
    pub const RETURN_COMPLETED: EventId = EventId::from_static("RETURN_COMPLETED");
    pub const CANCEL_SHIPPING: EventId = EventId::from_static("CANCEL_SHIPPING");
    pub const SELLER_PREPARATION_TIMEOUT: EventId =
        EventId::from_static("SELLER_PREPARATION_TIMEOUT");
    pub const PICKUP_TIMEOUT: EventId = EventId::from_static("PICKUP_TIMEOUT");
    pub const SORTING_TIMEOUT: EventId = EventId::from_static("SORTING_TIMEOUT");
    pub const LOCAL_PROCESSING_TIMEOUT: EventId = EventId::from_static("LOCAL_PROCESSING_TIMEOUT");
}

fn validate_context(context: &SagaContext) -> std::result::Result<(), String> {
    match context.order_id.as_deref() {
        Some(id) if !id.trim().is_empty() => Ok(()),
        _ => Err("orderId is required".to_string()),
    }
}

/// Builds the shipping saga definition.
pub fn definition() -> Result<SagaDefinition> {
    use events::*;
    use states::*;

    let forward: [(StateId, _, StateId); 16] = [
        (SHIPPING_CREATED, START_SHIPPING, SELLER_PREPARING),
        (SELLER_PREPARING, SELLER_COMPLETED_PREPARING, SELLER_PREPARED),
        (SELLER_PREPARED, PICKUP_REQUESTED, PICKUP_SCHEDULED),
        (PICKUP_SCHEDULED, PICKUP_COMPLETED, PICKED_UP),
        (PICKED_UP, ARRIVED_AT_SORTING_CENTER, SORTING_CENTER_RECEIVED),
        (SORTING_CENTER_RECEIVED, START_SORTING, SORTING_CENTER_PROCESSING),
        (SORTING_CENTER_PROCESSING, SORTING_COMPLETED, SORTING_CENTER_COMPLETED),
        (SORTING_CENTER_COMPLETED, ARRIVED_AT_LOCAL_WAREHOUSE, LOCAL_WAREHOUSE_RECEIVED),
        (LOCAL_WAREHOUSE_RECEIVED, START_LOCAL_PROCESSING, LOCAL_WAREHOUSE_PROCESSING),
        (LOCAL_WAREHOUSE_PROCESSING, READY_FOR_DELIVERY, LOCAL_WAREHOUSE_READY),
        (LOCAL_WAREHOUSE_READY, START_DELIVERY, OUT_FOR_DELIVERY),
        (OUT_FOR_DELIVERY, DELIVERY_COMPLETED, DELIVERED),
        (OUT_FOR_DELIVERY, DELIVERY_ATTEMPT_FAILED, DELIVERY_FAILED),
        (DELIVERY_FAILED, START_DELIVERY, OUT_FOR_DELIVERY),
        (DELIVERED, COMPLETE_SHIPPING, SHIPPING_COMPLETED),
        (RETURNED_TO_SELLER, COMPLETE_SHIPPING, SHIPPING_COMPLETED),
    ];
    let returns = [
        (DELIVERED, START_RETURN, RETURNING_TO_SELLER),
        (DELIVERY_FAILED, START_RETURN, RETURNING_TO_SELLER),
        (RETURNING_TO_SELLER, RETURN_COMPLETED, RETURNED_TO_SELLER),
    ];
    let cancellable = [
        SELLER_PREPARING,
        PICKUP_SCHEDULED,
        SORTING_CENTER_PROCESSING,
        LOCAL_WAREHOUSE_PROCESSING,
    ];
    let timeouts = [
        (SELLER_PREPARING, SELLER_PREPARATION_TIMEOUT),
        (PICKUP_SCHEDULED, PICKUP_TIMEOUT),
        (SORTING_CENTER_PROCESSING, SORTING_TIMEOUT),
        (LOCAL_WAREHOUSE_PROCESSING, LOCAL_PROCESSING_TIMEOUT),
    ];
    let live = [
        SHIPPING_CREATED,
        SELLER_PREPARING,
        SELLER_PREPARED,
        PICKUP_SCHEDULED,
        PICKED_UP,
        SORTING_CENTER_RECEIVED,
        SORTING_CENTER_PROCESSING,
        SORTING_CENTER_COMPLETED,
        LOCAL_WAREHOUSE_RECEIVED,
        LOCAL_WAREHOUSE_PROCESSING,
        LOCAL_WAREHOUSE_READY,
        OUT_FOR_DELIVERY,
        DELIVERED,
        DELIVERY_FAILED,
        RETURNING_TO_SELLER,
        RETURNED_TO_SELLER,
    ];

    let mut builder = SagaDefinition::builder(SHIPPING_SAGA)
        .initial_state(SHIPPING_CREATED)
        .start_event(START_SHIPPING)
        .timeout(SHIPPING_SAGA_TIMEOUT)
        .validator(validate_context)
        .terminal(SHIPPING_COMPLETED, TerminalOutcome::Completed)
        .terminal(SHIPPING_CANCELLED, TerminalOutcome::Failed)
        .terminal(SHIPPING_FAILED, TerminalOutcome::Failed);

    for (source, event, target) in forward.into_iter().chain(returns) {
        builder = builder.transition(source, event, target);
    }
    for state in cancellable {
        builder = builder.compensation(state, CANCEL_SHIPPING, SHIPPING_CANCELLED, None);
    }
    for (state, event) in timeouts {
        builder = builder.transition(state, event, SHIPPING_FAILED);
    }
    for state in live {
        builder = builder
            .transition(state.clone(), RESUME, state.clone())
            .compensation(state, COMPENSATE, SHIPPING_CANCELLED, None);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{Step, apply_event, initial_instance};
    use chrono::Utc;
    use common::SagaId;
    use saga_store::SagaStatus;

    #[test]
    fn test_definition_builds() {
        let definition = definition().unwrap();
        assert_eq!(definition.states().len(), 19);
        assert!(definition.is_terminal(&states::SHIPPING_CANCELLED));
    }

    #[test]
    fn test_happy_path_reaches_completed() {
        let definition = definition().unwrap();
        let now = Utc::now();
        let (mut instance, _) = initial_instance(
            &definition,
            SagaId::new(),
            SagaContext::for_order("O1", 1.0),
            now,
        );
        let path = [
            events::START_SHIPPING,
            events::SELLER_COMPLETED_PREPARING,
            events::PICKUP_REQUESTED,
            events::PICKUP_COMPLETED,
            events::ARRIVED_AT_SORTING_CENTER,
            events::START_SORTING,
            events::SORTING_COMPLETED,
            events::ARRIVED_AT_LOCAL_WAREHOUSE,
            events::START_LOCAL_PROCESSING,
            events::READY_FOR_DELIVERY,
            events::START_DELIVERY,
            events::DELIVERY_COMPLETED,
            events::COMPLETE_SHIPPING,
        ];
        for event in path {
            instance = match apply_event(&definition, &instance, &event, now, "n").unwrap() {
                Step::Advanced(effects) => effects.instance,
                other => panic!("{event} not applied: {other:?}"),
            };
        }
        assert_eq!(instance.current_state, states::SHIPPING_COMPLETED);
        assert_eq!(instance.status, SagaStatus::Completed);
    }

    #[test]
    fn test_cancel_only_from_cancellable_states() {
        let definition = definition().unwrap();
        assert!(
            definition
                .transition(&states::PICKUP_SCHEDULED, &events::CANCEL_SHIPPING)
                .is_some()
        );
        assert!(
            definition
                .transition(&states::OUT_FOR_DELIVERY, &events::CANCEL_SHIPPING)
                .is_none()
        );
        let timeout = definition
            .transition(&states::SORTING_CENTER_PROCESSING, &events::SORTING_TIMEOUT)
            .unwrap();
        assert_eq!(timeout.target, states::SHIPPING_FAILED);
    }
}
