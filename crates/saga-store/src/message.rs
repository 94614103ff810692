use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MessageId, SagaId};

/// Delivery status of an outbox message. Only ever moves forward from `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    #[default]
    Pending,
    Sent,
    Failed,
    Duplicate,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Failed => "FAILED",
            OutboxStatus::Duplicate => "DUPLICATE",
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "SENT" => Ok(OutboxStatus::Sent),
            "FAILED" => Ok(OutboxStatus::Failed),
            "DUPLICATE" => Ok(OutboxStatus::Duplicate),
            other => Err(format!("unknown outbox status: {other}")),
        }
    }
}

/// An outbound message staged in the same transaction as the state change
/// that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub saga_id: Option<SagaId>,
    pub exchange: String,
    pub routing_key: String,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Creates a new pending message.
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: MessageId::new(),
            saga_id: None,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload,
            idempotency_key: None,
            status: OutboxStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
            processed_at: None,
            claimed_by: None,
            claimed_until: None,
        }
    }

    /// Associates the message with a saga.
    pub fn for_saga(mut self, saga_id: SagaId) -> Self {
        self.saga_id = Some(saga_id);
        self
    }

    /// Sets the key used to suppress duplicate sends.
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Overrides the creation timestamp, which also decides relay order.
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Per-status message counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
    pub duplicate: u64,
}

impl OutboxStats {
    pub(crate) fn add(&mut self, status: OutboxStatus, n: u64) {
        match status {
            OutboxStatus::Pending => self.pending += n,
            OutboxStatus::Sent => self.sent += n,
            OutboxStatus::Failed => self.failed += n,
            OutboxStatus::Duplicate => self.duplicate += n,
        }
    }
}

/// Outcome recorded for a processed inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessedStatus {
    Success,
    Failed,
}

impl ProcessedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessedStatus::Success => "SUCCESS",
            ProcessedStatus::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for ProcessedStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(ProcessedStatus::Success),
            "FAILED" => Ok(ProcessedStatus::Failed),
            other => Err(format!("unknown processed status: {other}")),
        }
    }
}

/// Write-once proof that an inbound request id was already handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedMessage {
    pub request_id: String,
    pub saga_id: Option<SagaId>,
    pub service_name: String,
    pub operation: String,
    pub status: ProcessedStatus,
    /// What the work produced, such as the event it applied.
    pub result_id: Option<String>,
    pub error: Option<String>,
    pub processed_at: DateTime<Utc>,
}

/// A time-bounded lock held by one orchestrator node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    pub key: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockLease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
