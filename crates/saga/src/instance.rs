//! Typed view of a persisted saga instance.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::SagaId;
use saga_store::{Checkpoint, SagaRecord, SagaStatus};
use serde::Serialize;

use crate::context::SagaContext;
use crate::definition::StateId;
use crate::error::Result;

/// A saga instance with its typed context and checkpoint history.
///
/// `current_state` always equals the state of the last checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaInstance {
    pub id: SagaId,
    pub saga_type: String,
    pub current_state: StateId,
    pub status: SagaStatus,
    pub context: SagaContext,
    pub metadata: BTreeMap<String, String>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub compensation_triggered: bool,
    pub compensation_from_state: Option<StateId>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub checkpoints: Vec<Checkpoint>,
}

impl SagaInstance {
    /// Rebuilds an instance from its stored row and checkpoints.
    pub fn from_record(record: SagaRecord, checkpoints: Vec<Checkpoint>) -> Result<Self> {
        let context = SagaContext::from_json(record.context)?;
        Ok(Self {
            id: record.id,
            saga_type: record.saga_type,
            current_state: StateId::from(record.current_state),
            status: record.status,
            context,
            metadata: record.metadata,
            retry_count: record.retry_count,
            next_retry_at: record.next_retry_at,
            compensation_triggered: record.compensation_triggered,
            compensation_from_state: record.compensation_from_state.map(StateId::from),
            error_message: record.error_message,
            created_at: record.created_at,
            updated_at: record.updated_at,
            timeout_at: record.timeout_at,
            completed_at: record.completed_at,
            version: record.version,
            checkpoints,
        })
    }

    /// Produces the row to persist.
    pub fn to_record(&self) -> Result<SagaRecord> {
        Ok(SagaRecord {
            id: self.id,
            saga_type: self.saga_type.clone(),
            current_state: self.current_state.to_string(),
            status: self.status,
            context: self.context.to_json()?,
            metadata: self.metadata.clone(),
            retry_count: self.retry_count,
            next_retry_at: self.next_retry_at,
            compensation_triggered: self.compensation_triggered,
            compensation_from_state: self.compensation_from_state.as_ref().map(|s| s.to_string()),
            error_message: self.error_message.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            timeout_at: self.timeout_at,
            completed_at: self.completed_at,
            version: self.version,
        })
    }

    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.status == SagaStatus::InProgress && now > self.timeout_at
    }

    /// The latest checkpoint without an error, the resumption point for recovery.
    pub fn last_good_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.iter().rev().find(|c| c.is_good())
    }

    /// Returns true if some good checkpoint recorded `state`.
    pub fn has_good_checkpoint_in(&self, state: &StateId) -> bool {
        self.checkpoints
            .iter()
            .any(|c| c.is_good() && c.state == state.as_str())
    }
}

/// Reconstructs the current state from a checkpoint list.
pub fn replay_state(checkpoints: &[Checkpoint]) -> Option<StateId> {
    checkpoints
        .iter()
        .max_by_key(|c| c.sequence)
        .map(|c| StateId::from(c.state.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(saga_id: SagaId, sequence: i64, state: &str, error: Option<&str>) -> Checkpoint {
        Checkpoint {
            saga_id,
            sequence,
            state: state.to_string(),
            event: None,
            action_result: None,
            retry_count: 0,
            error: error.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    fn record(saga_id: SagaId) -> SagaRecord {
        let now = Utc::now();
        SagaRecord {
            id: saga_id,
            saga_type: "ORDER_SAGA".to_string(),
            current_state: "PAYMENT_PROCESSING".to_string(),
            status: SagaStatus::InProgress,
            context: serde_json::json!({"orderId": "O1", "amount": 100}),
            metadata: BTreeMap::new(),
            retry_count: 0,
            next_retry_at: None,
            compensation_triggered: false,
            compensation_from_state: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            timeout_at: now + chrono::Duration::minutes(30),
            completed_at: None,
            version: 3,
        }
    }

    #[test]
    fn test_record_roundtrip_keeps_typed_context() {
        let id = SagaId::new();
        let instance = SagaInstance::from_record(record(id), Vec::new()).unwrap();
        assert_eq!(instance.context.order_id.as_deref(), Some("O1"));
        assert_eq!(instance.current_state, StateId::from("PAYMENT_PROCESSING"));

        let back = instance.to_record().unwrap();
        assert_eq!(back.id, id);
        assert_eq!(back.version, 3);
        assert_eq!(back.context["orderId"], "O1");
    }

    #[test]
    fn test_last_good_checkpoint_skips_errors() {
        let id = SagaId::new();
        let checkpoints = vec![
            checkpoint(id, 1, "ORDER_CREATED", None),
            checkpoint(id, 2, "PAYMENT_PROCESSING", None),
            checkpoint(id, 3, "PAYMENT_PROCESSING", Some("declined")),
        ];
        let instance = SagaInstance::from_record(record(id), checkpoints).unwrap();
        let good = instance.last_good_checkpoint().unwrap();
        assert_eq!(good.sequence, 2);
        assert!(instance.has_good_checkpoint_in(&StateId::from("ORDER_CREATED")));
        assert!(!instance.has_good_checkpoint_in(&StateId::from("PAYMENT_COMPLETED")));
    }

    #[test]
    fn test_replay_uses_highest_sequence() {
        let id = SagaId::new();
        let checkpoints = vec![
            checkpoint(id, 2, "PAYMENT_PROCESSING", None),
            checkpoint(id, 1, "ORDER_CREATED", None),
        ];
        assert_eq!(
            replay_state(&checkpoints),
            Some(StateId::from("PAYMENT_PROCESSING"))
        );
        assert_eq!(replay_state(&[]), None);
    }

    #[test]
    fn test_timeout_applies_only_in_progress() {
        let id = SagaId::new();
        let mut instance = SagaInstance::from_record(record(id), Vec::new()).unwrap();
        let later = instance.timeout_at + chrono::Duration::seconds(1);
        assert!(instance.is_timed_out(later));
        assert!(!instance.is_timed_out(instance.timeout_at));
        instance.status = SagaStatus::Compensating;
        assert!(!instance.is_timed_out(later));
    }
}
