use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Processor-side lifecycle of a transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum TransferState {
    Pending,
    Succeeded,
    Failed,
    Canceled,
}

impl TransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Pending => "PENDING",
            TransferState::Succeeded => "SUCCEEDED",
            TransferState::Failed => "FAILED",
            TransferState::Canceled => "CANCELED",
        }
    }

    /// Finix also reports `UNKNOWN` while a transfer is still settling with the
    /// network; that is treated as pending.
    pub fn from_processor(value: &str) -> Self {
        match value.trim().to_uppercase().as_str() {
            "SUCCEEDED" => TransferState::Succeeded,
            "FAILED" => TransferState::Failed,
            "CANCELED" | "CANCELLED" => TransferState::Canceled,
            _ => TransferState::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferState::Pending)
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BillingAddress {
    pub line1: Option<String>,
    pub line2: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

/// Where the credential for a new payment instrument comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrumentSource {
    /// Finix.js tokenized card or bank account
    Token { token: String },
    GooglePay { third_party_token: String },
    ApplePay { third_party_token: String },
}

impl InstrumentSource {
    pub fn processor_type(&self) -> &'static str {
        match self {
            InstrumentSource::Token { .. } => "TOKEN",
            InstrumentSource::GooglePay { .. } => "GOOGLE_PAY",
            InstrumentSource::ApplePay { .. } => "APPLE_PAY",
        }
    }

    /// Payment-type discriminator recorded on the ledger row.
    pub fn payment_type(&self) -> &'static str {
        match self {
            InstrumentSource::Token { .. } => "card",
            InstrumentSource::GooglePay { .. } => "google-pay",
            InstrumentSource::ApplePay { .. } => "apple-pay",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateInstrumentRequest {
    pub source: InstrumentSource,
    /// Buyer identity the instrument belongs to
    pub identity_id: String,
    /// Required by the processor for digital-wallet instruments
    pub merchant_identity_id: Option<String>,
    pub name: Option<String>,
    pub billing_address: Option<BillingAddress>,
}

/// Display attributes pulled from an instrument; never used for control flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstrumentDisplay {
    pub brand: Option<String>,
    pub last_four: Option<String>,
    pub expiration_month: Option<u8>,
    pub expiration_year: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentResult {
    pub instrument_id: String,
    pub instrument_type: String,
    pub display: InstrumentDisplay,
    pub provider_data: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub amount_cents: i64,
    pub currency: String,
    /// Processor merchant ID receiving the funds
    pub merchant_id: String,
    /// Processor payment-instrument ID being debited
    pub source_instrument_id: String,
    /// Forwarded to the processor as its idempotency token
    pub operation_key: String,
    pub fraud_session_id: Option<String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer_id: String,
    pub state: TransferState,
    pub amount_cents: i64,
    pub provider_data: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct ReversalRequest {
    pub transfer_id: String,
    pub amount_cents: i64,
    pub reason: Option<String>,
    pub operation_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReversalResult {
    pub reversal_id: String,
    pub state: TransferState,
    pub amount_cents: i64,
    pub provider_data: Option<JsonValue>,
}

// ============================================================================
// Webhook payloads
// ============================================================================

/// Finix webhook envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub entity: String,
    pub occurred_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "_embedded", default)]
    pub embedded: WebhookEmbedded,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookEmbedded {
    #[serde(default)]
    pub transfers: Vec<WebhookTransfer>,
    #[serde(default)]
    pub merchants: Vec<WebhookMerchant>,
    #[serde(default)]
    pub identities: Vec<WebhookIdentity>,
    #[serde(default, alias = "payment_instruments")]
    pub instruments: Vec<WebhookInstrument>,
    #[serde(default)]
    pub disputes: Vec<WebhookDispute>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTransfer {
    pub id: String,
    pub state: String,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub idempotency_id: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub failure_code: Option<String>,
    #[serde(default)]
    pub failure_message: Option<String>,
    #[serde(rename = "type", default)]
    pub transfer_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookMerchant {
    pub id: String,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub onboarding_state: Option<String>,
    #[serde(default)]
    pub processing_enabled: Option<bool>,
    #[serde(default)]
    pub settlement_enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookIdentity {
    pub id: String,
    #[serde(default)]
    pub entity: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookInstrument {
    pub id: String,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub instrument_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDispute {
    pub id: String,
    #[serde(default)]
    pub transfer: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub respond_by: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_state_maps_processor_values() {
        assert_eq!(TransferState::from_processor("SUCCEEDED"), TransferState::Succeeded);
        assert_eq!(TransferState::from_processor("canceled"), TransferState::Canceled);
        assert_eq!(TransferState::from_processor("UNKNOWN"), TransferState::Pending);
        assert!(!TransferState::Pending.is_terminal());
        assert!(TransferState::Failed.is_terminal());
    }

    #[test]
    fn webhook_envelope_deserializes_with_instrument_alias() {
        let payload = serde_json::json!({
            "id": "event_1",
            "type": "updated",
            "entity": "payment_instrument",
            "occurred_at": "2026-02-12T00:00:00Z",
            "_embedded": {
                "payment_instruments": [{"id": "PI123", "enabled": false}]
            }
        });
        let parsed: WebhookEnvelope =
            serde_json::from_value(payload).expect("deserialization should succeed");
        assert_eq!(parsed.embedded.instruments.len(), 1);
        assert_eq!(parsed.embedded.instruments[0].enabled, Some(false));
        assert!(parsed.embedded.transfers.is_empty());
    }

    #[test]
    fn webhook_transfer_reads_tags() {
        let payload = serde_json::json!({
            "id": "TR1",
            "state": "SUCCEEDED",
            "amount": 10320,
            "idempotency_id": "permit_abc",
            "tags": {"transaction_id": "5b0c"}
        });
        let parsed: WebhookTransfer = serde_json::from_value(payload).unwrap();
        assert_eq!(parsed.tags.get("transaction_id").map(String::as_str), Some("5b0c"));
        assert_eq!(parsed.amount, Some(10320));
    }
}
