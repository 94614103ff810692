use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};

/// Exchange carrying orchestrator commands to downstream services.
pub const COMMAND_EXCHANGE: &str = "saga.commands";

/// Exchange carrying downstream replies back to the orchestrator.
pub const REPLY_EXCHANGE: &str = "saga.replies";

/// A command sent to a downstream service.
///
/// `request_id` is stable for one logical request, so a re-issued command
/// lets the receiver deduplicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaCommand {
    pub saga_id: SagaId,
    pub request_id: String,
    pub action: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl SagaCommand {
    pub fn new(
        saga_id: SagaId,
        request_id: impl Into<String>,
        action: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            saga_id,
            request_id: request_id.into(),
            action: action.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// A downstream service's answer to a [`SagaCommand`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaReply {
    pub saga_id: SagaId,
    /// Echo of the command's request id.
    pub request_id: String,
    /// Replying service, e.g. `payment`.
    pub service: String,
    /// Echo of the command's action.
    pub action: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SagaReply {
    /// Builds a successful reply to a command.
    pub fn success(command: &SagaCommand, service: &str, payload: serde_json::Value) -> Self {
        Self {
            saga_id: command.saga_id,
            request_id: command.request_id.clone(),
            service: service.to_string(),
            action: command.action.clone(),
            success: true,
            reason: None,
            payload,
        }
    }

    /// Builds a failed reply to a command.
    pub fn failure(command: &SagaCommand, service: &str, reason: impl Into<String>) -> Self {
        Self {
            saga_id: command.saga_id,
            request_id: command.request_id.clone(),
            service: service.to_string(),
            action: command.action.clone(),
            success: false,
            reason: Some(reason.into()),
            payload: serde_json::Value::Null,
        }
    }

    /// Returns a string field of the payload, if present.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_uses_camel_case_on_the_wire() {
        let command = SagaCommand::new(
            SagaId::new(),
            "payment-1",
            "PROCESS_PAYMENT",
            serde_json::json!({"amount": 100.0}),
        );
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["requestId"], "payment-1");
        assert!(json.get("sagaId").is_some());
    }

    #[test]
    fn test_reply_parses_without_optional_fields() {
        let saga_id = SagaId::new();
        let json = serde_json::json!({
            "sagaId": saga_id.to_string(),
            "requestId": "inventory-1",
            "service": "inventory",
            "action": "RESERVE_INVENTORY",
            "success": false
        });
        let reply: SagaReply = serde_json::from_value(json).unwrap();
        assert_eq!(reply.saga_id, saga_id);
        assert!(reply.reason.is_none());
        assert!(reply.payload.is_null());
    }

    #[test]
    fn test_failure_echoes_command() {
        let command = SagaCommand::new(
            SagaId::new(),
            "inventory-1",
            "RESERVE_INVENTORY",
            serde_json::Value::Null,
        );
        let reply = SagaReply::failure(&command, "inventory", "INSUFFICIENT");
        assert_eq!(reply.request_id, "inventory-1");
        assert_eq!(reply.action, "RESERVE_INVENTORY");
        assert_eq!(reply.reason.as_deref(), Some("INSUFFICIENT"));
    }
}
