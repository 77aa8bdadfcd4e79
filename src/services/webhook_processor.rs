use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::database::error::DatabaseError;
use crate::database::merchant_repository::{MerchantProcessorUpdate, MerchantStore};
use crate::database::payment_method_repository::PaymentMethodStore;
use crate::database::transaction_repository::{
    PaymentStatus, PaymentTransaction, TransactionStatusUpdate,
};
use crate::database::webhook_repository::{
    DisputeRecord, WebhookEvent, WebhookEventStatus, WebhookStore,
};
use crate::payments::types::{TransferState, WebhookEnvelope, WebhookTransfer};
use crate::payments::utils::{secure_eq, verify_hmac_sha256_hex};
use crate::services::entity_status::EntityStatusUpdater;
use crate::services::idempotency::OperationKey;
use crate::services::transaction_ledger::{LedgerError, StatusUpdateOutcome, TransactionLedger};

const RETRY_BATCH_SIZE: i64 = 50;

#[derive(Debug, Error)]
pub enum WebhookProcessorError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Already processed")]
    AlreadyProcessed,
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Processing error: {0}")]
    ProcessingError(String),
}

impl From<DatabaseError> for WebhookProcessorError {
    fn from(err: DatabaseError) -> Self {
        WebhookProcessorError::DatabaseError(err.to_string())
    }
}

impl From<LedgerError> for WebhookProcessorError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Persistence(db) => db.into(),
            other => WebhookProcessorError::ProcessingError(other.to_string()),
        }
    }
}

/// What handling an event amounted to. Both are acknowledged with a 2xx.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    Ignored(String),
}

/// Credentials the processor presents on each callback.
#[derive(Clone)]
pub struct WebhookAuth {
    pub bearer_token: String,
    /// HMAC-SHA256 key for the `Finix-Signature` header, when configured
    pub signing_key: Option<String>,
}

pub struct WebhookProcessor {
    webhooks: Arc<dyn WebhookStore>,
    ledger: Arc<TransactionLedger>,
    merchants: Arc<dyn MerchantStore>,
    payment_methods: Arc<dyn PaymentMethodStore>,
    fulfillment: Arc<EntityStatusUpdater>,
    auth: WebhookAuth,
    max_retries: i32,
}

impl WebhookProcessor {
    pub fn new(
        webhooks: Arc<dyn WebhookStore>,
        ledger: Arc<TransactionLedger>,
        merchants: Arc<dyn MerchantStore>,
        payment_methods: Arc<dyn PaymentMethodStore>,
        fulfillment: Arc<EntityStatusUpdater>,
        auth: WebhookAuth,
        max_retries: i32,
    ) -> Self {
        Self {
            webhooks,
            ledger,
            merchants,
            payment_methods,
            fulfillment,
            auth,
            max_retries,
        }
    }

    /// Checks the bearer token and, when a signing key is configured, the
    /// body signature.
    pub fn authenticate(
        &self,
        authorization: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<(), WebhookProcessorError> {
        if self.auth.bearer_token.is_empty() {
            return Err(WebhookProcessorError::Unauthorized(
                "webhook token not configured".to_string(),
            ));
        }
        let presented = authorization
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or_else(|| WebhookProcessorError::Unauthorized("missing bearer token".to_string()))?;
        if !secure_eq(presented.as_bytes(), self.auth.bearer_token.as_bytes()) {
            return Err(WebhookProcessorError::Unauthorized(
                "bearer token mismatch".to_string(),
            ));
        }

        if let Some(key) = &self.auth.signing_key {
            let signature = signature.ok_or(WebhookProcessorError::InvalidSignature)?;
            if !verify_hmac_sha256_hex(body, key, signature) {
                return Err(WebhookProcessorError::InvalidSignature);
            }
        }
        Ok(())
    }

    /// Logs the delivery, then applies it. A delivery of an event that was
    /// already processed returns `AlreadyProcessed` without side effects.
    pub async fn process_webhook(
        &self,
        payload: &JsonValue,
    ) -> Result<WebhookOutcome, WebhookProcessorError> {
        let event_id = payload
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("unidentified_{}", Uuid::new_v4().simple()));
        let event_type = payload
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let entity = payload
            .get("entity")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");

        let webhook_event = self
            .webhooks
            .log_event(&event_id, event_type, entity, payload)
            .await?;

        info!(
            event_id = %event_id,
            event_type = %event_type,
            entity = %entity,
            delivery_count = webhook_event.delivery_count,
            "Webhook received"
        );

        if webhook_event.status == WebhookEventStatus::Processed {
            info!(event_id = %event_id, "Webhook already processed");
            return Err(WebhookProcessorError::AlreadyProcessed);
        }

        match self.process_event(&webhook_event).await {
            Ok(outcome) => {
                self.webhooks.mark_processed(webhook_event.id).await?;
                info!(event_id = %event_id, outcome = ?outcome, "Webhook processed successfully");
                Ok(outcome)
            }
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "Webhook processing failed");
                self.webhooks
                    .record_failure(webhook_event.id, &e.to_string())
                    .await?;
                Err(e)
            }
        }
    }

    /// Keeps an authenticated body that is not JSON in the event log, stored
    /// as a JSON string, and marks it failed.
    pub async fn record_unparseable(
        &self,
        body: &[u8],
        reason: &str,
    ) -> Result<(), WebhookProcessorError> {
        let event_id = format!("unparseable_{}", Uuid::new_v4().simple());
        let payload = JsonValue::String(String::from_utf8_lossy(body).into_owned());
        let webhook_event = self
            .webhooks
            .log_event(&event_id, "unknown", "unknown", &payload)
            .await?;
        self.webhooks
            .record_failure(webhook_event.id, &format!("invalid JSON: {}", reason))
            .await?;
        warn!(event_id = %event_id, error = %reason, "Unparseable webhook body logged");
        Ok(())
    }

    async fn process_event(
        &self,
        webhook_event: &WebhookEvent,
    ) -> Result<WebhookOutcome, WebhookProcessorError> {
        let envelope: WebhookEnvelope = serde_json::from_value(webhook_event.payload.clone())
            .map_err(|e| WebhookProcessorError::InvalidPayload(e.to_string()))?;

        match envelope.entity.as_str() {
            "transfer" => self.handle_transfers(&envelope, webhook_event).await,
            "merchant" => self.handle_merchants(&envelope).await,
            "identity" => self.handle_identities(&envelope).await,
            "payment_instrument" | "instrument" => self.handle_instruments(&envelope).await,
            "dispute" => self.handle_disputes(&envelope).await,
            other => {
                info!(entity = %other, event_type = %envelope.event_type, "Unhandled webhook entity");
                Ok(WebhookOutcome::Ignored(format!("unhandled entity {}", other)))
            }
        }
    }

    async fn handle_transfers(
        &self,
        envelope: &WebhookEnvelope,
        webhook_event: &WebhookEvent,
    ) -> Result<WebhookOutcome, WebhookProcessorError> {
        if envelope.embedded.transfers.is_empty() {
            return Ok(WebhookOutcome::Ignored("no transfers in event".to_string()));
        }
        let occurred_at = envelope.occurred_at.unwrap_or(webhook_event.received_at);

        let mut processed = false;
        let mut last_reason = String::new();
        for transfer in &envelope.embedded.transfers {
            match self
                .reconcile_transfer(&envelope.id, occurred_at, transfer)
                .await?
            {
                WebhookOutcome::Processed => processed = true,
                WebhookOutcome::Ignored(reason) => last_reason = reason,
            }
        }

        Ok(if processed {
            WebhookOutcome::Processed
        } else {
            WebhookOutcome::Ignored(last_reason)
        })
    }

    /// Finds the ledger row for a transfer: by transfer id first, then by the
    /// transaction id tag, then by the idempotency id the transfer was
    /// created with. The fallbacks cover transfers whose synchronous call
    /// timed out before the transfer id was recorded.
    async fn find_transaction(
        &self,
        transfer: &WebhookTransfer,
    ) -> Result<Option<PaymentTransaction>, WebhookProcessorError> {
        if let Some(tx) = self.ledger.find_by_transfer_id(&transfer.id).await? {
            return Ok(Some(tx));
        }

        let unlinked = |tx: &PaymentTransaction| {
            tx.finix_transfer_id.is_none() || tx.finix_transfer_id.as_deref() == Some(&transfer.id)
        };

        if let Some(id) = transfer
            .tags
            .get("transaction_id")
            .and_then(|v| Uuid::parse_str(v).ok())
        {
            if let Some(tx) = self.ledger.find_by_id(id).await?.filter(|tx| unlinked(tx)) {
                return Ok(Some(tx));
            }
        }

        if let Some(key) = transfer
            .idempotency_id
            .as_deref()
            .and_then(|k| OperationKey::parse(k).ok())
        {
            if let Some(tx) = self
                .ledger
                .find_by_operation_key(&key)
                .await?
                .filter(|tx| unlinked(tx))
            {
                return Ok(Some(tx));
            }
        }

        Ok(None)
    }

    async fn reconcile_transfer(
        &self,
        event_id: &str,
        occurred_at: DateTime<Utc>,
        transfer: &WebhookTransfer,
    ) -> Result<WebhookOutcome, WebhookProcessorError> {
        let Some(tx) = self.find_transaction(transfer).await? else {
            info!(transfer_id = %transfer.id, "No transaction for transfer webhook");
            return Ok(WebhookOutcome::Ignored(format!(
                "no transaction for transfer {}",
                transfer.id
            )));
        };

        let state = TransferState::from_processor(&transfer.state);
        let target = PaymentStatus::for_transfer_state(state);

        if tx.payment_status == target
            && tx.transfer_state == state
            && tx.finix_transfer_id.as_deref() == Some(transfer.id.as_str())
        {
            info!(
                transaction_id = %tx.id,
                transfer_id = %transfer.id,
                state = state.as_str(),
                "Transfer already in reported state"
            );
            return Ok(WebhookOutcome::Ignored("already in reported state".to_string()));
        }
        if tx.payment_status != PaymentStatus::Unpaid {
            warn!(
                transaction_id = %tx.id,
                transfer_id = %transfer.id,
                ledger_status = tx.payment_status.as_str(),
                reported_state = state.as_str(),
                "Ignoring transfer webhook for finalized transaction"
            );
            return Ok(WebhookOutcome::Ignored("transaction already finalized".to_string()));
        }
        if tx.last_webhook_at.is_some_and(|last| last > occurred_at) {
            info!(
                transaction_id = %tx.id,
                transfer_id = %transfer.id,
                "Skipping stale transfer webhook"
            );
            return Ok(WebhookOutcome::Ignored("stale event".to_string()));
        }

        let mut update = TransactionStatusUpdate::new(tx.id, state);
        update.finix_transfer_id = Some(transfer.id.clone());
        update.raw_finix_response = serde_json::to_value(transfer).ok();
        update.failure_reason = transfer
            .failure_message
            .clone()
            .or_else(|| transfer.failure_code.clone());
        update.webhook_event_id = Some(event_id.to_string());
        update.webhook_occurred_at = Some(occurred_at);

        match self.ledger.update_status(&update).await? {
            StatusUpdateOutcome::Applied(updated) => {
                info!(
                    transaction_id = %updated.id,
                    transfer_id = %transfer.id,
                    payment_status = updated.payment_status.as_str(),
                    "Transaction reconciled from webhook"
                );
                if updated.payment_status == PaymentStatus::Paid {
                    let report = self.fulfillment.fulfill(&updated).await;
                    for warning in &report.warnings {
                        error!(transaction_id = %updated.id, warning = %warning, "Fulfillment incomplete");
                    }
                }
                Ok(WebhookOutcome::Processed)
            }
            StatusUpdateOutcome::AlreadyApplied(_) => {
                Ok(WebhookOutcome::Ignored("already in reported state".to_string()))
            }
            StatusUpdateOutcome::Rejected(_) => {
                Ok(WebhookOutcome::Ignored("status change rejected".to_string()))
            }
        }
    }

    async fn handle_merchants(
        &self,
        envelope: &WebhookEnvelope,
    ) -> Result<WebhookOutcome, WebhookProcessorError> {
        let mut updated = 0;
        for merchant in &envelope.embedded.merchants {
            let update = MerchantProcessorUpdate {
                finix_merchant_id: merchant.id.clone(),
                finix_identity_id: merchant.identity.clone(),
                onboarding_state: merchant.onboarding_state.clone(),
                processing_enabled: merchant.processing_enabled,
            };
            if self.merchants.apply_processor_update(&update).await? {
                info!(
                    finix_merchant_id = %merchant.id,
                    onboarding_state = ?merchant.onboarding_state,
                    "Merchant updated from webhook"
                );
                updated += 1;
            } else {
                info!(finix_merchant_id = %merchant.id, "Webhook for unknown merchant");
            }
        }
        Ok(Self::count_outcome(updated, "merchant"))
    }

    async fn handle_identities(
        &self,
        envelope: &WebhookEnvelope,
    ) -> Result<WebhookOutcome, WebhookProcessorError> {
        let mut updated = 0;
        for identity in &envelope.embedded.identities {
            if self.merchants.touch_identity(&identity.id).await? {
                updated += 1;
            }
        }
        Ok(Self::count_outcome(updated, "identity"))
    }

    async fn handle_instruments(
        &self,
        envelope: &WebhookEnvelope,
    ) -> Result<WebhookOutcome, WebhookProcessorError> {
        let mut updated = 0;
        for instrument in &envelope.embedded.instruments {
            let Some(enabled) = instrument.enabled else {
                continue;
            };
            if self
                .payment_methods
                .set_enabled_by_processor_id(&instrument.id, enabled)
                .await?
            {
                info!(instrument_id = %instrument.id, enabled, "Payment method updated from webhook");
                updated += 1;
            }
        }
        Ok(Self::count_outcome(updated, "payment instrument"))
    }

    async fn handle_disputes(
        &self,
        envelope: &WebhookEnvelope,
    ) -> Result<WebhookOutcome, WebhookProcessorError> {
        for dispute in &envelope.embedded.disputes {
            let transaction_id = match &dispute.transfer {
                Some(transfer_id) => self
                    .ledger
                    .find_by_transfer_id(transfer_id)
                    .await?
                    .map(|tx| tx.id),
                None => None,
            };

            self.webhooks
                .upsert_dispute(&DisputeRecord {
                    finix_dispute_id: dispute.id.clone(),
                    finix_transfer_id: dispute.transfer.clone(),
                    state: dispute.state.clone(),
                    reason: dispute.reason.clone(),
                    amount_cents: dispute.amount,
                    respond_by: dispute.respond_by,
                    transaction_id,
                })
                .await?;

            warn!(
                dispute_id = %dispute.id,
                transfer_id = ?dispute.transfer,
                state = ?dispute.state,
                "Dispute recorded"
            );
        }
        Ok(Self::count_outcome(envelope.embedded.disputes.len(), "dispute"))
    }

    fn count_outcome(updated: usize, kind: &str) -> WebhookOutcome {
        if updated > 0 {
            WebhookOutcome::Processed
        } else {
            WebhookOutcome::Ignored(format!("no matching {} records", kind))
        }
    }

    /// Re-drives events whose processing failed (called by background worker)
    pub async fn retry_pending(&self) -> Result<usize, WebhookProcessorError> {
        let failed = self
            .webhooks
            .get_failed_events(RETRY_BATCH_SIZE, self.max_retries)
            .await?;

        let mut processed = 0;
        for webhook in failed {
            match self.process_event(&webhook).await {
                Ok(_) => {
                    self.webhooks.mark_processed(webhook.id).await?;
                    processed += 1;
                }
                Err(e) => {
                    warn!(
                        event_id = %webhook.event_id,
                        retry_count = webhook.retry_count + 1,
                        error = %e,
                        "Webhook retry failed"
                    );
                    self.webhooks
                        .record_failure(webhook.id, &e.to_string())
                        .await?;
                }
            }
        }

        Ok(processed)
    }
}
