use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SagaId;

/// Lifecycle status of a saga instance.
///
/// ```text
/// InProgress ──┬──► Completed
///              ├──► Failed
///              └──► Compensating ──┬──► Failed
///                                  └──► ManualInterventionRequired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    #[default]
    InProgress,
    Compensating,
    Completed,
    Failed,
    ManualInterventionRequired,
}

impl SagaStatus {
    /// Returns true if no further events are accepted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Failed | SagaStatus::ManualInterventionRequired
        )
    }

    /// Returns the status name as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::InProgress => "IN_PROGRESS",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Failed => "FAILED",
            SagaStatus::ManualInterventionRequired => "MANUAL_INTERVENTION_REQUIRED",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SagaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(SagaStatus::InProgress),
            "COMPENSATING" => Ok(SagaStatus::Compensating),
            "COMPLETED" => Ok(SagaStatus::Completed),
            "FAILED" => Ok(SagaStatus::Failed),
            "MANUAL_INTERVENTION_REQUIRED" => Ok(SagaStatus::ManualInterventionRequired),
            other => Err(format!("unknown saga status: {other}")),
        }
    }
}

/// Persisted row of a saga instance.
///
/// The context is stored as opaque JSON; the orchestrator owns its shape.
/// `metadata` is a flat string map kept queryable for operator lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub id: SagaId,
    pub saga_type: String,
    pub current_state: String,
    pub status: SagaStatus,
    pub context: serde_json::Value,
    pub metadata: BTreeMap<String, String>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub compensation_triggered: bool,
    pub compensation_from_state: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency counter. Equals the sequence of the latest checkpoint.
    pub version: i64,
}

/// An append-only snapshot taken after every attempted transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub saga_id: SagaId,
    pub sequence: i64,
    pub state: String,
    pub event: Option<String>,
    pub action_result: Option<serde_json::Value>,
    pub retry_count: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Returns true if the checkpoint can serve as a recovery point.
    pub fn is_good(&self) -> bool {
        self.error.is_none()
    }
}

/// Audit row describing one attempted transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub source_state: String,
    pub target_state: String,
    pub event: String,
    pub action_name: Option<String>,
    pub duration_ms: i64,
    pub error: Option<String>,
    pub is_compensation: bool,
    /// Orchestrator node that executed the transition.
    pub instance_id: String,
    pub created_at: DateTime<Utc>,
}
