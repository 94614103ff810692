//! Pure transition logic.
//!
//! Every function here takes a snapshot and returns the write set the
//! engine should commit. Nothing touches storage or the clock.

use std::time::Instant;

use chrono::{DateTime, Utc};
use common::SagaId;
use outbox::COMMAND_EXCHANGE;
use saga_store::{Checkpoint, HistoryEntry, OutboxMessage, SagaStatus, TransitionWrite};

use crate::context::SagaContext;
use crate::definition::{COMPENSATE, EventId, RESUME, SagaDefinition, StateId, TerminalOutcome};
use crate::error::{Result, SagaError};
use crate::instance::SagaInstance;

const RESTORE_EVENT: &str = "RESTORE";
const ESCALATE_EVENT: &str = "ESCALATE";

/// Post-transition snapshot plus everything to persist with it.
#[derive(Debug, Clone)]
pub struct Effects {
    pub instance: SagaInstance,
    pub write: TransitionWrite,
    pub action: Option<&'static str>,
    pub is_compensation: bool,
}

/// Why an event was not applied. Nothing is written for a rejection.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// The instance already reached a terminal status.
    Terminal(SagaStatus),
    /// No transition for (current state, event).
    NoTransition { state: StateId, event: EventId },
    /// The saga is past its deadline and must be compensated instead.
    TimedOut(DateTime<Utc>),
}

/// Outcome of applying an event to a snapshot.
#[derive(Debug, Clone)]
pub enum Step {
    /// The transition ran; the instance moved to the target state.
    Advanced(Box<Effects>),
    /// The action failed; an error checkpoint at the unchanged state is recorded.
    ActionFailed(Box<Effects>),
    Rejected(Rejection),
}

/// Builds a fresh instance in the definition's initial state, returned with
/// its first checkpoint.
pub fn initial_instance(
    definition: &SagaDefinition,
    saga_id: SagaId,
    context: SagaContext,
    now: DateTime<Utc>,
) -> (SagaInstance, Checkpoint) {
    let timeout = chrono::Duration::from_std(definition.timeout())
        .unwrap_or_else(|_| chrono::Duration::days(365));
    let state = definition.initial_state().clone();
    let checkpoint = Checkpoint {
        saga_id,
        sequence: 1,
        state: state.to_string(),
        event: None,
        action_result: None,
        retry_count: 0,
        error: None,
        created_at: now,
    };
    let instance = SagaInstance {
        id: saga_id,
        saga_type: definition.saga_type().to_string(),
        current_state: state,
        status: SagaStatus::InProgress,
        metadata: context.metadata(),
        context,
        retry_count: 0,
        next_retry_at: None,
        compensation_triggered: false,
        compensation_from_state: None,
        error_message: None,
        created_at: now,
        updated_at: now,
        timeout_at: now + timeout,
        completed_at: None,
        version: 1,
        checkpoints: vec![checkpoint.clone()],
    };
    (instance, checkpoint)
}

/// Applies `event` to `instance` according to `definition`.
pub fn apply_event(
    definition: &SagaDefinition,
    instance: &SagaInstance,
    event: &EventId,
    now: DateTime<Utc>,
    node_id: &str,
) -> Result<Step> {
    if instance.status.is_terminal() {
        return Ok(Step::Rejected(Rejection::Terminal(instance.status)));
    }
    if instance.is_timed_out(now) && event != &COMPENSATE {
        return Ok(Step::Rejected(Rejection::TimedOut(instance.timeout_at)));
    }
    run_transition(definition, instance.clone(), event, now, node_id)
}

/// Starts compensation from the current state.
///
/// A saga already compensating gets RESUME instead, which re-issues the
/// pending compensation command. The deadline does not apply.
pub fn begin_compensation(
    definition: &SagaDefinition,
    instance: &SagaInstance,
    reason: &str,
    now: DateTime<Utc>,
    node_id: &str,
) -> Result<Step> {
    if instance.status.is_terminal() {
        return Ok(Step::Rejected(Rejection::Terminal(instance.status)));
    }
    if instance.status == SagaStatus::Compensating {
        return run_transition(definition, instance.clone(), &RESUME, now, node_id);
    }

    let mut snapshot = instance.clone();
    snapshot.compensation_triggered = true;
    snapshot.compensation_from_state = Some(instance.current_state.clone());
    snapshot.error_message = Some(reason.to_string());
    snapshot.context.last_error = Some(reason.to_string());
    run_transition(definition, snapshot, &COMPENSATE, now, node_id)
}

fn run_transition(
    definition: &SagaDefinition,
    mut snapshot: SagaInstance,
    event: &EventId,
    now: DateTime<Utc>,
    node_id: &str,
) -> Result<Step> {
    let source = snapshot.current_state.clone();
    let Some(transition) = definition.transition(&source, event) else {
        return Ok(Step::Rejected(Rejection::NoTransition {
            state: source,
            event: event.clone(),
        }));
    };

    let expected_version = snapshot.version;
    let action = transition.action_name();
    let started = Instant::now();
    let mut context = snapshot.context.clone();
    let outcome = match transition.action {
        Some(ref action) => action.execute(snapshot.id, &mut context).map(Some),
        None => Ok(None),
    };
    let duration_ms = started.elapsed().as_millis() as i64;

    snapshot.version += 1;
    snapshot.updated_at = now;
    let sequence = snapshot.version;

    match outcome {
        Ok(output) => {
            if transition.is_compensation && !snapshot.compensation_triggered {
                snapshot.compensation_triggered = true;
                snapshot.compensation_from_state = Some(source.clone());
            }
            if event != &RESUME {
                snapshot.retry_count = 0;
                snapshot.next_retry_at = None;
            }
            snapshot.status = match definition.outcome(&transition.target) {
                Some(TerminalOutcome::Completed) => SagaStatus::Completed,
                Some(TerminalOutcome::Failed) => SagaStatus::Failed,
                None if transition.is_compensation => SagaStatus::Compensating,
                None => snapshot.status,
            };
            if snapshot.status.is_terminal() {
                snapshot.completed_at = Some(now);
            }
            snapshot.current_state = transition.target.clone();
            snapshot.metadata = context.metadata();
            snapshot.context = context;

            let (result, commands) = match output {
                Some(output) => (Some(output.result), output.commands),
                None => (None, Vec::new()),
            };
            let mut outbox = Vec::with_capacity(commands.len());
            for command in commands {
                let key = format!("{}:{}:{}", snapshot.id, command.command.action, sequence);
                let payload = serde_json::to_value(&command.command)?;
                outbox.push(
                    OutboxMessage::new(COMMAND_EXCHANGE, command.routing_key, payload)
                        .for_saga(snapshot.id)
                        .idempotency_key(key)
                        .created_at(now),
                );
            }

            let checkpoint = Checkpoint {
                saga_id: snapshot.id,
                sequence,
                state: snapshot.current_state.to_string(),
                event: Some(event.to_string()),
                action_result: result,
                retry_count: snapshot.retry_count,
                error: None,
                created_at: now,
            };
            let history = history_entry(
                &snapshot,
                &source,
                &transition.target,
                event.as_str(),
                action,
                duration_ms,
                None,
                transition.is_compensation,
                node_id,
                now,
            );
            let effects = finish(
                snapshot,
                expected_version,
                checkpoint,
                history,
                outbox,
                action,
                transition.is_compensation,
            )?;
            Ok(Step::Advanced(Box::new(effects)))
        }
        Err(err) => {
            let message = err.to_string();
            snapshot.error_message = Some(message.clone());
            snapshot.context.last_error = Some(message.clone());

            let checkpoint = Checkpoint {
                saga_id: snapshot.id,
                sequence,
                state: source.to_string(),
                event: Some(event.to_string()),
                action_result: None,
                retry_count: snapshot.retry_count,
                error: Some(message.clone()),
                created_at: now,
            };
            let history = history_entry(
                &snapshot,
                &source,
                &transition.target,
                event.as_str(),
                action,
                duration_ms,
                Some(message),
                transition.is_compensation,
                node_id,
                now,
            );
            let effects = finish(
                snapshot,
                expected_version,
                checkpoint,
                history,
                Vec::new(),
                action,
                transition.is_compensation,
            )?;
            Ok(Step::ActionFailed(Box::new(effects)))
        }
    }
}

/// Moves the instance back to the state of a good checkpoint.
///
/// The restore is itself a new checkpoint, so the current state keeps
/// matching the latest one.
pub fn restore(
    instance: &SagaInstance,
    state: &StateId,
    retry_count: u32,
    next_retry_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    node_id: &str,
) -> Result<Effects> {
    if !instance.has_good_checkpoint_in(state) {
        return Err(SagaError::InvalidRestore {
            saga_id: instance.id,
            state: state.to_string(),
        });
    }
    let source = instance.current_state.clone();
    let mut snapshot = instance.clone();
    let expected_version = snapshot.version;
    snapshot.version += 1;
    snapshot.updated_at = now;
    snapshot.current_state = state.clone();
    snapshot.retry_count = retry_count;
    snapshot.next_retry_at = next_retry_at;

    let checkpoint = Checkpoint {
        saga_id: snapshot.id,
        sequence: snapshot.version,
        state: state.to_string(),
        event: Some(RESTORE_EVENT.to_string()),
        action_result: Some(serde_json::json!({ "restoredFrom": source.as_str() })),
        retry_count,
        error: None,
        created_at: now,
    };
    let history = history_entry(
        &snapshot,
        &source,
        state,
        RESTORE_EVENT,
        None,
        0,
        None,
        false,
        node_id,
        now,
    );
    finish(
        snapshot,
        expected_version,
        checkpoint,
        history,
        Vec::new(),
        None,
        false,
    )
}

/// Hands the saga to an operator.
pub fn escalate(
    instance: &SagaInstance,
    reason: &str,
    now: DateTime<Utc>,
    node_id: &str,
) -> Result<Effects> {
    let state = instance.current_state.clone();
    let mut snapshot = instance.clone();
    let expected_version = snapshot.version;
    snapshot.version += 1;
    snapshot.updated_at = now;
    snapshot.status = SagaStatus::ManualInterventionRequired;
    snapshot.completed_at = Some(now);
    snapshot.error_message = Some(reason.to_string());
    snapshot.context.last_error = Some(reason.to_string());

    let checkpoint = Checkpoint {
        saga_id: snapshot.id,
        sequence: snapshot.version,
        state: state.to_string(),
        event: Some(ESCALATE_EVENT.to_string()),
        action_result: None,
        retry_count: snapshot.retry_count,
        error: Some(reason.to_string()),
        created_at: now,
    };
    let history = history_entry(
        &snapshot,
        &state,
        &state,
        ESCALATE_EVENT,
        None,
        0,
        Some(reason.to_string()),
        snapshot.compensation_triggered,
        node_id,
        now,
    );
    finish(
        snapshot,
        expected_version,
        checkpoint,
        history,
        Vec::new(),
        None,
        false,
    )
}

#[allow(clippy::too_many_arguments)]
fn history_entry(
    snapshot: &SagaInstance,
    source: &StateId,
    target: &StateId,
    event: &str,
    action: Option<&'static str>,
    duration_ms: i64,
    error: Option<String>,
    is_compensation: bool,
    node_id: &str,
    now: DateTime<Utc>,
) -> HistoryEntry {
    HistoryEntry {
        saga_id: snapshot.id,
        saga_type: snapshot.saga_type.clone(),
        source_state: source.to_string(),
        target_state: target.to_string(),
        event: event.to_string(),
        action_name: action.map(str::to_string),
        duration_ms,
        error,
        is_compensation,
        instance_id: node_id.to_string(),
        created_at: now,
    }
}

fn finish(
    mut snapshot: SagaInstance,
    expected_version: i64,
    checkpoint: Checkpoint,
    history: HistoryEntry,
    outbox: Vec<OutboxMessage>,
    action: Option<&'static str>,
    is_compensation: bool,
) -> Result<Effects> {
    snapshot.checkpoints.push(checkpoint.clone());
    let write = TransitionWrite {
        record: snapshot.to_record()?,
        expected_version,
        checkpoint,
        history: Some(history),
        outbox,
    };
    Ok(Effects {
        instance: snapshot,
        write,
        action,
        is_compensation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order_saga::{self, events, states};

    fn started(now: DateTime<Utc>) -> (SagaDefinition, SagaInstance) {
        let definition = order_saga::definition().unwrap();
        let (instance, _) = initial_instance(
            &definition,
            SagaId::new(),
            SagaContext::for_order("O1", 100.0),
            now,
        );
        (definition, instance)
    }

    fn advance(step: Step) -> SagaInstance {
        match step {
            Step::Advanced(effects) => effects.instance,
            other => panic!("expected advance, got {other:?}"),
        }
    }

    #[test]
    fn test_initial_instance_has_first_checkpoint() {
        let now = Utc::now();
        let (_, instance) = started(now);
        assert_eq!(instance.current_state, states::ORDER_CREATED);
        assert_eq!(instance.version, 1);
        assert_eq!(instance.checkpoints.len(), 1);
        assert_eq!(instance.timeout_at, now + chrono::Duration::minutes(30));
        assert_eq!(instance.metadata["orderId"], "O1");
    }

    #[test]
    fn test_start_event_stages_payment_command() {
        let now = Utc::now();
        let (definition, instance) = started(now);
        let Step::Advanced(effects) =
            apply_event(&definition, &instance, &events::START_SAGA, now, "node-1").unwrap()
        else {
            panic!("expected advance");
        };
        assert_eq!(effects.instance.current_state, states::PAYMENT_PROCESSING);
        assert_eq!(effects.write.expected_version, 1);
        assert_eq!(effects.write.record.version, 2);
        assert_eq!(effects.write.checkpoint.sequence, 2);
        assert_eq!(effects.write.outbox.len(), 1);
        let message = &effects.write.outbox[0];
        assert_eq!(message.routing_key, "payment.process");
        assert_eq!(
            message.idempotency_key.as_deref(),
            Some(format!("{}:PROCESS_PAYMENT:2", instance.id).as_str())
        );
        assert_eq!(message.payload["action"], "PROCESS_PAYMENT");
        assert_eq!(effects.write.history.as_ref().unwrap().instance_id, "node-1");
        saga_store::validate_transition_write(&effects.write).unwrap();
    }

    #[test]
    fn test_unknown_event_is_rejected_without_changes() {
        let now = Utc::now();
        let (definition, instance) = started(now);
        let step = apply_event(
            &definition,
            &instance,
            &events::SHIPPING_SCHEDULED,
            now,
            "node-1",
        )
        .unwrap();
        assert!(matches!(
            step,
            Step::Rejected(Rejection::NoTransition { .. })
        ));
    }

    #[test]
    fn test_deadline_rejects_forward_events() {
        let now = Utc::now();
        let (definition, instance) = started(now);
        let late = instance.timeout_at + chrono::Duration::seconds(1);
        let step = apply_event(&definition, &instance, &events::START_SAGA, late, "n").unwrap();
        assert!(matches!(step, Step::Rejected(Rejection::TimedOut(_))));

        let step = begin_compensation(&definition, &instance, "deadline", late, "n").unwrap();
        let cancelled = advance(step);
        assert_eq!(cancelled.current_state, states::ORDER_CANCELLED);
        assert_eq!(cancelled.status, SagaStatus::Failed);
        assert!(cancelled.compensation_triggered);
        assert_eq!(
            cancelled.compensation_from_state,
            Some(states::ORDER_CREATED)
        );
    }

    #[test]
    fn test_failure_path_ends_failed_with_compensation() {
        let now = Utc::now();
        let (definition, instance) = started(now);
        let s = advance(apply_event(&definition, &instance, &events::START_SAGA, now, "n").unwrap());
        let mut s = advance(apply_event(&definition, &s, &events::PAYMENT_SUCCESS, now, "n").unwrap());
        s.context.payment_id = Some("PAY-0001".to_string());
        let s = advance(
            apply_event(&definition, &s, &events::INVENTORY_INSUFFICIENT, now, "n").unwrap(),
        );
        assert_eq!(s.current_state, states::COMPENSATING_PAYMENT);
        assert_eq!(s.status, SagaStatus::Compensating);
        assert!(s.compensation_triggered);

        let s = advance(apply_event(&definition, &s, &events::PAYMENT_COMPENSATED, now, "n").unwrap());
        assert_eq!(s.current_state, states::COMPENSATION_COMPLETED);
        assert_eq!(s.status, SagaStatus::Failed);
        assert!(s.completed_at.is_some());

        let step = apply_event(&definition, &s, &events::PAYMENT_COMPENSATED, now, "n").unwrap();
        assert!(matches!(
            step,
            Step::Rejected(Rejection::Terminal(SagaStatus::Failed))
        ));
    }

    #[test]
    fn test_action_failure_keeps_state_and_records_error() {
        let now = Utc::now();
        let (definition, instance) = started(now);
        let s = advance(apply_event(&definition, &instance, &events::START_SAGA, now, "n").unwrap());
        let s = advance(apply_event(&definition, &s, &events::PAYMENT_SUCCESS, now, "n").unwrap());
        // Scheduling shipping needs a reservation id, which is missing here.
        let step = apply_event(&definition, &s, &events::INVENTORY_RESERVED, now, "n").unwrap();
        let Step::ActionFailed(effects) = step else {
            panic!("expected action failure");
        };
        assert_eq!(effects.instance.current_state, states::PAYMENT_COMPLETED);
        assert_eq!(effects.instance.status, SagaStatus::InProgress);
        assert!(effects.write.checkpoint.error.is_some());
        assert!(effects.write.outbox.is_empty());
        assert!(effects.write.history.as_ref().unwrap().error.is_some());
        assert_eq!(
            effects.instance.last_good_checkpoint().unwrap().state,
            "PAYMENT_COMPLETED"
        );
        saga_store::validate_transition_write(&effects.write).unwrap();
    }

    #[test]
    fn test_restore_requires_good_checkpoint() {
        let now = Utc::now();
        let (definition, instance) = started(now);
        let s = advance(apply_event(&definition, &instance, &events::START_SAGA, now, "n").unwrap());
        let effects = restore(&s, &states::ORDER_CREATED, 1, None, now, "n").unwrap();
        assert_eq!(effects.instance.current_state, states::ORDER_CREATED);
        assert_eq!(effects.instance.retry_count, 1);
        assert_eq!(effects.write.checkpoint.state, "ORDER_CREATED");
        saga_store::validate_transition_write(&effects.write).unwrap();

        let err = restore(&s, &states::ORDER_COMPLETED, 1, None, now, "n").unwrap_err();
        assert!(matches!(err, SagaError::InvalidRestore { .. }));
    }

    #[test]
    fn test_escalate_is_terminal() {
        let now = Utc::now();
        let (_, instance) = started(now);
        let effects = escalate(&instance, "refund rejected", now, "n").unwrap();
        assert_eq!(
            effects.instance.status,
            SagaStatus::ManualInterventionRequired
        );
        assert_eq!(effects.instance.current_state, states::ORDER_CREATED);
        assert_eq!(
            effects.instance.error_message.as_deref(),
            Some("refund rejected")
        );
    }

    #[test]
    fn test_resume_keeps_retry_count_and_reissues_command() {
        let now = Utc::now();
        let (definition, instance) = started(now);
        let s = advance(apply_event(&definition, &instance, &events::START_SAGA, now, "n").unwrap());
        let restored = restore(&s, &states::PAYMENT_PROCESSING, 2, None, now, "n")
            .unwrap()
            .instance;
        let Step::Advanced(effects) =
            apply_event(&definition, &restored, &RESUME, now, "n").unwrap()
        else {
            panic!("expected advance");
        };
        assert_eq!(effects.instance.retry_count, 2);
        assert_eq!(effects.write.outbox.len(), 1);
        let first_request = s.context.request_ids["PROCESS_PAYMENT"].clone();
        assert_eq!(
            effects.write.outbox[0].payload["requestId"],
            first_request.as_str()
        );
    }
}
