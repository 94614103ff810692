//! Typed saga context.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Schema version written into new contexts.
pub const CONTEXT_SCHEMA_VERSION: u32 = 1;

fn current_schema() -> u32 {
    CONTEXT_SCHEMA_VERSION
}

/// Forward-compatible side-map for fields a saga type adds later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extensions {
    #[serde(default = "current_schema")]
    pub schema_version: u32,
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
}

impl Default for Extensions {
    fn default() -> Self {
        Self {
            schema_version: CONTEXT_SCHEMA_VERSION,
            values: BTreeMap::new(),
        }
    }
}

/// Business data and downstream correlation ids carried by a saga.
///
/// Validated once when the saga starts; actions read and update it
/// without casting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaContext {
    pub order_id: Option<String>,
    pub user_id: Option<String>,
    pub amount: Option<f64>,
    /// Product id to quantity.
    #[serde(default)]
    pub products: BTreeMap<String, u32>,
    pub payment_id: Option<String>,
    pub reservation_id: Option<String>,
    pub shipping_id: Option<String>,
    /// Stable request id per command action, reused when a command is re-issued.
    #[serde(default)]
    pub request_ids: BTreeMap<String, String>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub extensions: Extensions,
}

impl SagaContext {
    /// Creates a context for an order.
    pub fn for_order(order_id: impl Into<String>, amount: f64) -> Self {
        Self {
            order_id: Some(order_id.into()),
            amount: Some(amount),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_product(mut self, product_id: impl Into<String>, quantity: u32) -> Self {
        self.products.insert(product_id.into(), quantity);
        self
    }

    /// Returns the request id for an action, minting one on first use.
    pub fn request_id_for(&mut self, action: &str) -> String {
        self.request_ids
            .entry(action.to_string())
            .or_insert_with(|| format!("{}-{}", action.to_lowercase(), uuid::Uuid::new_v4()))
            .clone()
    }

    /// Reads an extension value.
    pub fn extension(&self, key: &str) -> Option<&serde_json::Value> {
        self.extensions.values.get(key)
    }

    /// Writes an extension value.
    pub fn set_extension(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.extensions.values.insert(key.into(), value);
    }

    /// Flat key/value view kept on the instance row for lookups.
    pub fn metadata(&self) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        let fields = [
            ("orderId", &self.order_id),
            ("userId", &self.user_id),
            ("paymentId", &self.payment_id),
            ("reservationId", &self.reservation_id),
            ("shippingId", &self.shipping_id),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                metadata.insert(key.to_string(), value.clone());
            }
        }
        if let Some(amount) = self.amount {
            metadata.insert("amount".to_string(), amount.to_string());
        }
        metadata
    }

    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    pub fn from_json(value: serde_json::Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    /// Names the fields only the engine may write that are already set.
    pub fn engine_owned_fields(&self) -> Vec<&'static str> {
        let mut owned = Vec::new();
        if self.payment_id.is_some() {
            owned.push("paymentId");
        }
        if self.reservation_id.is_some() {
            owned.push("reservationId");
        }
        if self.shipping_id.is_some() {
            owned.push("shippingId");
        }
        if !self.request_ids.is_empty() {
            owned.push("requestIds");
        }
        if self.last_error.is_some() {
            owned.push("lastError");
        }
        if self.extensions.schema_version != CONTEXT_SCHEMA_VERSION {
            owned.push("extensions.schemaVersion");
        }
        owned
    }
}

/// Business fields a caller supplies when starting a saga.
///
/// Correlation ids, request ids and error state belong to the engine and
/// are rejected here as unknown fields.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContextInput {
    pub order_id: Option<String>,
    pub user_id: Option<String>,
    pub amount: Option<f64>,
    #[serde(default)]
    pub products: BTreeMap<String, u32>,
    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl From<ContextInput> for SagaContext {
    fn from(input: ContextInput) -> Self {
        Self {
            order_id: input.order_id,
            user_id: input.user_id,
            amount: input.amount,
            products: input.products,
            extensions: Extensions {
                values: input.extensions,
                ..Extensions::default()
            },
            ..Self::default()
        }
    }
}

/// Correlation data a reply carries into the context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextPatch {
    pub payment_id: Option<String>,
    pub reservation_id: Option<String>,
    pub shipping_id: Option<String>,
    pub last_error: Option<String>,
}

impl ContextPatch {
    pub fn is_empty(&self) -> bool {
        self == &ContextPatch::default()
    }

    /// Copies every present field into the context.
    pub fn apply(&self, context: &mut SagaContext) {
        if let Some(ref id) = self.payment_id {
            context.payment_id = Some(id.clone());
        }
        if let Some(ref id) = self.reservation_id {
            context.reservation_id = Some(id.clone());
        }
        if let Some(ref id) = self.shipping_id {
            context.shipping_id = Some(id.clone());
        }
        if let Some(ref error) = self.last_error {
            context.last_error = Some(error.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_json_parses_with_defaults() {
        let ctx: SagaContext =
            serde_json::from_value(serde_json::json!({"orderId": "O1", "amount": 100})).unwrap();
        assert_eq!(ctx.order_id.as_deref(), Some("O1"));
        assert_eq!(ctx.amount, Some(100.0));
        assert!(ctx.products.is_empty());
        assert_eq!(ctx.extensions.schema_version, CONTEXT_SCHEMA_VERSION);
    }

    #[test]
    fn test_unknown_extension_values_survive_roundtrip() {
        let mut ctx = SagaContext::for_order("O1", 10.0);
        ctx.set_extension("giftWrap", serde_json::json!(true));
        let back = SagaContext::from_json(ctx.to_json().unwrap()).unwrap();
        assert_eq!(back.extension("giftWrap"), Some(&serde_json::json!(true)));
    }

    #[test]
    fn test_request_id_is_stable_per_action() {
        let mut ctx = SagaContext::for_order("O1", 10.0);
        let first = ctx.request_id_for("PROCESS_PAYMENT");
        let second = ctx.request_id_for("PROCESS_PAYMENT");
        let other = ctx.request_id_for("REFUND_PAYMENT");
        assert_eq!(first, second);
        assert_ne!(first, other);
        assert!(first.starts_with("process_payment-"));
    }

    #[test]
    fn test_metadata_lists_present_ids() {
        let mut ctx = SagaContext::for_order("O1", 100.0).with_user("U1");
        ctx.payment_id = Some("PAY-0001".to_string());
        let metadata = ctx.metadata();
        assert_eq!(metadata["orderId"], "O1");
        assert_eq!(metadata["paymentId"], "PAY-0001");
        assert_eq!(metadata["amount"], "100");
        assert!(!metadata.contains_key("shippingId"));
    }

    #[test]
    fn test_input_builds_clean_context() {
        let input: ContextInput = serde_json::from_value(serde_json::json!({
            "orderId": "O1",
            "amount": 25.5,
            "products": {"SKU-1": 2},
            "extensions": {"giftWrap": true}
        }))
        .unwrap();
        let ctx = SagaContext::from(input);
        assert_eq!(ctx.products["SKU-1"], 2);
        assert_eq!(ctx.extension("giftWrap"), Some(&serde_json::json!(true)));
        assert_eq!(ctx.extensions.schema_version, CONTEXT_SCHEMA_VERSION);
        assert!(ctx.engine_owned_fields().is_empty());
    }

    #[test]
    fn test_input_rejects_engine_owned_fields() {
        for field in ["requestIds", "paymentId", "lastError"] {
            let mut body = serde_json::json!({"orderId": "O1", "amount": 1.0});
            body[field] = serde_json::json!({});
            assert!(serde_json::from_value::<ContextInput>(body).is_err(), "{field}");
        }
    }

    #[test]
    fn test_engine_owned_fields_are_reported() {
        let mut ctx = SagaContext::for_order("O1", 1.0);
        ctx.request_id_for("PROCESS_PAYMENT");
        ctx.shipping_id = Some("TRACK-1".to_string());
        ctx.extensions.schema_version = CONTEXT_SCHEMA_VERSION + 1;
        assert_eq!(
            ctx.engine_owned_fields(),
            vec!["shippingId", "requestIds", "extensions.schemaVersion"]
        );
    }

    #[test]
    fn test_patch_only_overwrites_present_fields() {
        let mut ctx = SagaContext::for_order("O1", 1.0);
        ctx.payment_id = Some("PAY-1".to_string());
        ContextPatch {
            reservation_id: Some("RES-1".to_string()),
            ..Default::default()
        }
        .apply(&mut ctx);
        assert_eq!(ctx.payment_id.as_deref(), Some("PAY-1"));
        assert_eq!(ctx.reservation_id.as_deref(), Some("RES-1"));
    }
}
