use crate::config::FinixConfig;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentGateway;
use crate::payments::types::{
    CreateInstrumentRequest, InstrumentDisplay, InstrumentResult, InstrumentSource,
    ReversalRequest, ReversalResult, TransferRequest, TransferResult, TransferState,
};
use crate::payments::utils::{BasicCredentials, PaymentHttpClient};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{info, warn};

const PROVIDER: &str = "finix";

pub struct FinixGateway {
    base_url: String,
    api_version: String,
    credentials: BasicCredentials,
    http: PaymentHttpClient,
}

impl FinixGateway {
    pub fn new(config: &FinixConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(PROVIDER, Duration::from_secs(config.timeout_secs))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            credentials: BasicCredentials {
                username: config.username.clone(),
                password: config.password.clone(),
            },
            http,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        payload: &JsonValue,
    ) -> PaymentResult<T> {
        self.http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint(path),
                Some(&self.credentials),
                Some(payload),
                &[
                    ("Content-Type", "application/json"),
                    ("Finix-Version", self.api_version.as_str()),
                ],
            )
            .await
    }
}

/// A 2xx whose body lacks the fields we need: the processor acted, but we
/// cannot tell how.
fn unreadable(what: &str, raw: &JsonValue, err: serde_json::Error) -> PaymentError {
    PaymentError::AmbiguousResponse {
        provider: PROVIDER.to_string(),
        message: format!("unexpected {} response: {}", what, err),
        status_code: None,
        resource_id: raw.get("id").and_then(|id| id.as_str()).map(str::to_string),
    }
}

fn instrument_payload(request: &CreateInstrumentRequest) -> JsonValue {
    let mut payload = serde_json::json!({
        "type": request.source.processor_type(),
        "identity": request.identity_id,
    });

    match &request.source {
        InstrumentSource::Token { token } => {
            payload["token"] = JsonValue::String(token.clone());
        }
        InstrumentSource::GooglePay { third_party_token }
        | InstrumentSource::ApplePay { third_party_token } => {
            payload["third_party_token"] = JsonValue::String(third_party_token.clone());
            if let Some(merchant_identity) = &request.merchant_identity_id {
                payload["merchant_identity"] = JsonValue::String(merchant_identity.clone());
            }
        }
    }

    if let Some(name) = &request.name {
        payload["name"] = JsonValue::String(name.clone());
    }
    if let Some(address) = &request.billing_address {
        payload["address"] = serde_json::to_value(address).unwrap_or(JsonValue::Null);
    }
    payload
}

fn transfer_payload(request: &TransferRequest) -> JsonValue {
    let mut payload = serde_json::json!({
        "amount": request.amount_cents,
        "currency": request.currency,
        "merchant": request.merchant_id,
        "source": request.source_instrument_id,
        "idempotency_id": request.operation_key,
        "tags": request.tags,
    });
    if let Some(session) = &request.fraud_session_id {
        payload["fraud_session_id"] = JsonValue::String(session.clone());
    }
    payload
}

#[async_trait]
impl PaymentGateway for FinixGateway {
    async fn create_payment_instrument(
        &self,
        request: CreateInstrumentRequest,
    ) -> PaymentResult<InstrumentResult> {
        if request.identity_id.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "buyer identity is required to create a payment instrument".to_string(),
                field: Some("identity_id".to_string()),
            });
        }

        let raw: JsonValue = self
            .post("/payment_instruments", &instrument_payload(&request))
            .await?;
        let parsed: FinixInstrument =
            serde_json::from_value(raw.clone()).map_err(|e| PaymentError::ProviderError {
                provider: PROVIDER.to_string(),
                message: format!("unexpected payment instrument response: {}", e),
                status_code: None,
                retryable: false,
            })?;

        info!(
            instrument_id = %parsed.id,
            instrument_type = parsed.details.type_name(),
            "finix payment instrument created"
        );

        Ok(InstrumentResult {
            instrument_id: parsed.id,
            instrument_type: parsed.details.type_name().to_string(),
            display: parsed.details.display(),
            provider_data: Some(raw),
        })
    }

    async fn create_transfer(&self, request: TransferRequest) -> PaymentResult<TransferResult> {
        if request.amount_cents <= 0 {
            return Err(PaymentError::ValidationError {
                message: "transfer amount must be positive".to_string(),
                field: Some("amount".to_string()),
            });
        }

        let raw: JsonValue = self.post("/transfers", &transfer_payload(&request)).await?;
        let transfer: FinixTransfer =
            serde_json::from_value(raw.clone()).map_err(|e| unreadable("transfer", &raw, e))?;

        let state = TransferState::from_processor(&transfer.state);
        match state {
            TransferState::Failed | TransferState::Canceled => {
                warn!(
                    transfer_id = %transfer.id,
                    failure_code = ?transfer.failure_code,
                    "finix transfer declined"
                );
                Err(PaymentError::PaymentDeclinedError {
                    message: transfer
                        .failure_message
                        .unwrap_or_else(|| "transfer was declined".to_string()),
                    failure_code: transfer.failure_code,
                    transfer_id: Some(transfer.id),
                })
            }
            TransferState::Succeeded | TransferState::Pending => {
                info!(
                    transfer_id = %transfer.id,
                    state = %state,
                    amount = transfer.amount,
                    "finix transfer created"
                );
                Ok(TransferResult {
                    transfer_id: transfer.id,
                    state,
                    amount_cents: transfer.amount,
                    provider_data: Some(raw),
                })
            }
        }
    }

    async fn create_reversal(&self, request: ReversalRequest) -> PaymentResult<ReversalResult> {
        let mut payload = serde_json::json!({
            "refund_amount": request.amount_cents,
            "idempotency_id": request.operation_key,
        });
        if let Some(reason) = &request.reason {
            payload["tags"] = serde_json::json!({ "reason": reason });
        }

        let raw: JsonValue = self
            .post(
                &format!("/transfers/{}/reversals", request.transfer_id),
                &payload,
            )
            .await?;
        let reversal: FinixTransfer =
            serde_json::from_value(raw.clone()).map_err(|e| unreadable("reversal", &raw, e))?;

        info!(
            transfer_id = %request.transfer_id,
            reversal_id = %reversal.id,
            amount = reversal.amount,
            "finix reversal created"
        );

        Ok(ReversalResult {
            reversal_id: reversal.id,
            state: TransferState::from_processor(&reversal.state),
            amount_cents: reversal.amount,
            provider_data: Some(raw),
        })
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }
}

#[derive(Debug, Deserialize)]
struct FinixTransfer {
    id: String,
    #[serde(default)]
    amount: i64,
    state: String,
    #[serde(default)]
    failure_code: Option<String>,
    #[serde(default)]
    failure_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FinixInstrument {
    id: String,
    #[serde(flatten)]
    details: FinixInstrumentDetails,
}

/// Instrument response, one shape per `instrument_type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "instrument_type", rename_all = "SCREAMING_SNAKE_CASE")]
enum FinixInstrumentDetails {
    PaymentCard {
        #[serde(default)]
        brand: Option<String>,
        #[serde(default)]
        last_four: Option<String>,
        #[serde(default)]
        expiration_month: Option<u8>,
        #[serde(default)]
        expiration_year: Option<u16>,
    },
    BankAccount {
        #[serde(default)]
        masked_account_number: Option<String>,
        #[serde(default)]
        bank_code: Option<String>,
    },
    GooglePay(WalletInstrument),
    ApplePay(WalletInstrument),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WalletInstrument {
    #[serde(default)]
    brand: Option<String>,
    #[serde(default)]
    last_four: Option<String>,
    #[serde(default)]
    masked_number: Option<String>,
    #[serde(default)]
    expiration_month: Option<u8>,
    #[serde(default)]
    expiration_year: Option<u16>,
}

fn last_four_of(masked: &str) -> Option<String> {
    let digits: Vec<char> = masked.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 4 {
        return None;
    }
    Some(digits[digits.len() - 4..].iter().collect())
}

impl FinixInstrumentDetails {
    fn type_name(&self) -> &'static str {
        match self {
            FinixInstrumentDetails::PaymentCard { .. } => "PAYMENT_CARD",
            FinixInstrumentDetails::BankAccount { .. } => "BANK_ACCOUNT",
            FinixInstrumentDetails::GooglePay(_) => "GOOGLE_PAY",
            FinixInstrumentDetails::ApplePay(_) => "APPLE_PAY",
            FinixInstrumentDetails::Other => "OTHER",
        }
    }

    fn display(&self) -> InstrumentDisplay {
        match self {
            FinixInstrumentDetails::PaymentCard {
                brand,
                last_four,
                expiration_month,
                expiration_year,
            } => InstrumentDisplay {
                brand: brand.clone(),
                last_four: last_four.clone(),
                expiration_month: *expiration_month,
                expiration_year: *expiration_year,
            },
            FinixInstrumentDetails::BankAccount {
                masked_account_number,
                bank_code,
            } => InstrumentDisplay {
                brand: bank_code.clone(),
                last_four: masked_account_number.as_deref().and_then(last_four_of),
                expiration_month: None,
                expiration_year: None,
            },
            FinixInstrumentDetails::GooglePay(wallet) | FinixInstrumentDetails::ApplePay(wallet) => {
                InstrumentDisplay {
                    brand: wallet.brand.clone(),
                    last_four: wallet
                        .last_four
                        .clone()
                        .or_else(|| wallet.masked_number.as_deref().and_then(last_four_of)),
                    expiration_month: wallet.expiration_month,
                    expiration_year: wallet.expiration_year,
                }
            }
            FinixInstrumentDetails::Other => InstrumentDisplay::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn card_instrument_maps_display_fields() {
        let raw = serde_json::json!({
            "id": "PIcard",
            "instrument_type": "PAYMENT_CARD",
            "brand": "VISA",
            "last_four": "4242",
            "expiration_month": 12,
            "expiration_year": 2029
        });
        let parsed: FinixInstrument = serde_json::from_value(raw).unwrap();
        let display = parsed.details.display();
        assert_eq!(parsed.details.type_name(), "PAYMENT_CARD");
        assert_eq!(display.brand.as_deref(), Some("VISA"));
        assert_eq!(display.last_four.as_deref(), Some("4242"));
        assert_eq!(display.expiration_year, Some(2029));
    }

    #[test]
    fn wallet_instrument_falls_back_to_masked_number() {
        let raw = serde_json::json!({
            "id": "PIapple",
            "instrument_type": "APPLE_PAY",
            "brand": "MASTERCARD",
            "masked_number": "XXXXXX1881"
        });
        let parsed: FinixInstrument = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.details.type_name(), "APPLE_PAY");
        assert_eq!(parsed.details.display().last_four.as_deref(), Some("1881"));
    }

    #[test]
    fn bank_account_masks_to_last_four() {
        let raw = serde_json::json!({
            "id": "PIbank",
            "instrument_type": "BANK_ACCOUNT",
            "masked_account_number": "XXXXX6789",
            "bank_code": "123456789"
        });
        let parsed: FinixInstrument = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.details.display().last_four.as_deref(), Some("6789"));
    }

    #[test]
    fn unknown_instrument_type_is_tolerated() {
        let raw = serde_json::json!({"id": "PIx", "instrument_type": "VIRTUAL"});
        let parsed: FinixInstrument = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.details.display(), InstrumentDisplay::default());
    }

    #[test]
    fn transfer_without_state_is_ambiguous_but_keeps_its_id() {
        let raw = serde_json::json!({"id": "TRreal", "amount": 10_320});
        let err = serde_json::from_value::<FinixTransfer>(raw.clone())
            .map_err(|e| unreadable("transfer", &raw, e))
            .unwrap_err();
        assert!(err.outcome_unknown());
        assert!(!err.is_retryable());
        assert_eq!(err.resource_id(), Some("TRreal"));
    }

    #[test]
    fn transfer_payload_carries_idempotency_and_tags() {
        let mut tags = BTreeMap::new();
        tags.insert("transaction_id".to_string(), "abc".to_string());
        let payload = transfer_payload(&TransferRequest {
            amount_cents: 10_320,
            currency: "USD".to_string(),
            merchant_id: "MU1".to_string(),
            source_instrument_id: "PI1".to_string(),
            operation_key: "permit_k".to_string(),
            fraud_session_id: Some("fs".to_string()),
            tags,
        });
        assert_eq!(payload["amount"], 10_320);
        assert_eq!(payload["idempotency_id"], "permit_k");
        assert_eq!(payload["tags"]["transaction_id"], "abc");
        assert_eq!(payload["fraud_session_id"], "fs");
    }

    #[test]
    fn wallet_payload_includes_merchant_identity() {
        let payload = instrument_payload(&CreateInstrumentRequest {
            source: InstrumentSource::GooglePay {
                third_party_token: "gp_tok".to_string(),
            },
            identity_id: "IDbuyer".to_string(),
            merchant_identity_id: Some("IDmerchant".to_string()),
            name: Some("Pat Doe".to_string()),
            billing_address: None,
        });
        assert_eq!(payload["type"], "GOOGLE_PAY");
        assert_eq!(payload["third_party_token"], "gp_tok");
        assert_eq!(payload["merchant_identity"], "IDmerchant");
        assert!(payload.get("token").is_none());
    }
}
