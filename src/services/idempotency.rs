//! Operation keys and the audit metadata stored next to them.
//!
//! A generated key is random per call, so two logical attempts never collide
//! (retrying after a declined card must be allowed). Callers that want their
//! own retries deduplicated pass a stable key; the ledger's unique constraint
//! on the key then does the enforcement. After a failed attempt the caller's
//! key continues as `<key>:retry-<n>`, so repeated retries still collide.

use crate::database::entity_repository::EntityType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use uuid::Uuid;

pub const METADATA_SCHEMA_VERSION: u32 = 2;

const MIN_KEY_LEN: usize = 8;
const MAX_KEY_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationKey(String);

impl OperationKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accepts a caller-supplied key of 8-255 characters from `[A-Za-z0-9_:-]`.
    pub fn parse(value: &str) -> Result<Self, String> {
        let value = value.trim();
        if value.len() < MIN_KEY_LEN || value.len() > MAX_KEY_LEN {
            return Err(format!(
                "operation key must be between {} and {} characters",
                MIN_KEY_LEN, MAX_KEY_LEN
            ));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '-'))
        {
            return Err("operation key may only contain letters, digits, '_', ':' and '-'".into());
        }
        Ok(Self(value.to_string()))
    }

    /// Key for the `attempt`-th retry after this key's attempt failed. The
    /// same caller key always yields the same chain.
    pub fn retry(&self, attempt: u32) -> Result<Self, String> {
        Self::parse(&format!("{}:retry-{}", self.0, attempt))
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    Generated,
    CallerSupplied,
}

/// Inputs describing one payment attempt.
#[derive(Debug, Clone)]
pub struct OperationKeyRequest {
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub user_id: Uuid,
    pub session_id: Option<String>,
    pub base_amount_cents: i64,
    pub payment_instrument_id: String,
}

/// Random per call; the entity type prefix only aids log reading.
pub fn generate_operation_key(request: &OperationKeyRequest) -> OperationKey {
    OperationKey(format!(
        "{}_{}",
        request.entity_type.as_str(),
        Uuid::new_v4().simple()
    ))
}

/// Debugging payload stored with the ledger row. Never read for control flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyMetadata {
    pub schema_version: u32,
    pub key_source: KeySource,
    pub session_id: Option<String>,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub user_id: Uuid,
    pub base_amount_cents: i64,
    pub payment_instrument_id: String,
    pub payment_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_info: Option<JsonValue>,
    /// Set when a failed attempt's key was spent and a successor issued
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_operation_key: Option<String>,
    pub generated_at: DateTime<Utc>,
}

impl IdempotencyMetadata {
    pub fn for_request(
        request: &OperationKeyRequest,
        key_source: KeySource,
        payment_type: &str,
        client_info: Option<JsonValue>,
    ) -> Self {
        Self {
            schema_version: METADATA_SCHEMA_VERSION,
            key_source,
            session_id: request.session_id.clone(),
            entity_type: request.entity_type,
            entity_id: request.entity_id,
            user_id: request.user_id,
            base_amount_cents: request.base_amount_cents,
            payment_instrument_id: request.payment_instrument_id.clone(),
            payment_type: payment_type.to_string(),
            client_info,
            previous_operation_key: None,
            generated_at: Utc::now(),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> OperationKeyRequest {
        OperationKeyRequest {
            entity_type: EntityType::Permit,
            entity_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            session_id: Some("sess_1".to_string()),
            base_amount_cents: 10_000,
            payment_instrument_id: "PI123".to_string(),
        }
    }

    #[test]
    fn generated_keys_are_unique_for_identical_inputs() {
        let req = request();
        let first = generate_operation_key(&req);
        let second = generate_operation_key(&req);
        assert_ne!(first, second);
        assert!(first.as_str().starts_with("permit_"));
        assert!(OperationKey::parse(first.as_str()).is_ok());
    }

    #[test]
    fn caller_keys_are_validated() {
        assert!(OperationKey::parse("checkout:7f3a-01").is_ok());
        assert!(OperationKey::parse("short").is_err());
        assert!(OperationKey::parse("has spaces in it").is_err());
        assert!(OperationKey::parse(&"k".repeat(256)).is_err());
    }

    #[test]
    fn retry_keys_are_deterministic() {
        let key = OperationKey::parse("checkout:permit-01").unwrap();
        assert_eq!(key.retry(1).unwrap().as_str(), "checkout:permit-01:retry-1");
        assert_eq!(key.retry(2).unwrap(), key.retry(2).unwrap());
        assert!(OperationKey::parse(&"k".repeat(250)).unwrap().retry(1).is_err());
    }

    #[test]
    fn metadata_records_request_fields() {
        let req = request();
        let metadata = IdempotencyMetadata::for_request(
            &req,
            KeySource::Generated,
            "card",
            Some(serde_json::json!({"user_agent": "test"})),
        );
        let json = metadata.to_json();
        assert_eq!(json["schema_version"], METADATA_SCHEMA_VERSION);
        assert_eq!(json["key_source"], "generated");
        assert_eq!(json["entity_type"], "permit");
        assert_eq!(json["client_info"]["user_agent"], "test");
        assert!(json.get("previous_operation_key").is_none());
    }
}
