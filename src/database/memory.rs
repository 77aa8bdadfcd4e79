//! Process-local store used when external services are skipped and in tests.
//!
//! Mirrors the guards the Postgres queries apply (unique idempotency key,
//! unpaid-only status updates, conditional entity updates) so callers see the
//! same semantics against either backend.

use crate::database::entity_repository::{
    EntityPaymentUpdate, EntityRef, EntityStore, EntityType, ServiceTileFlags,
};
use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::merchant_repository::{Merchant, MerchantProcessorUpdate, MerchantStore};
use crate::database::payment_method_repository::{PaymentMethodStore, StoredPaymentMethod};
use crate::database::transaction_repository::{
    NewPaymentTransaction, PaymentStatus, PaymentTransaction, TransactionStatusUpdate,
    TransactionStore,
};
use crate::database::webhook_repository::{
    DisputeRecord, WebhookEvent, WebhookEventStatus, WebhookStore,
};
use crate::payments::types::TransferState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Payment-facing columns of an entity row.
#[derive(Debug, Clone)]
pub struct MemoryEntity {
    pub status: String,
    pub payment_status: String,
    pub total_amount_cents: Option<i64>,
    pub service_fee_cents: Option<i64>,
    pub payment_transaction_id: Option<Uuid>,
    pub finix_transfer_id: Option<String>,
    pub finix_payment_instrument_id: Option<String>,
    pub merchant_fee_snapshot: Option<JsonValue>,
    pub payment_processed_at: Option<DateTime<Utc>>,
    pub issued_at: Option<DateTime<Utc>>,
    pub tile_id: Option<Uuid>,
    /// Number of times a paid outcome was written
    pub payment_writes: u32,
}

impl MemoryEntity {
    fn new(status: &str) -> Self {
        Self {
            status: status.to_string(),
            payment_status: "unpaid".to_string(),
            total_amount_cents: None,
            service_fee_cents: None,
            payment_transaction_id: None,
            finix_transfer_id: None,
            finix_payment_instrument_id: None,
            merchant_fee_snapshot: None,
            payment_processed_at: None,
            issued_at: None,
            tile_id: None,
            payment_writes: 0,
        }
    }
}

#[derive(Default)]
struct MemoryState {
    transactions: HashMap<Uuid, PaymentTransaction>,
    merchants: HashMap<Uuid, Merchant>,
    payment_methods: HashMap<Uuid, StoredPaymentMethod>,
    entities: HashMap<EntityRef, MemoryEntity>,
    tiles: HashMap<Uuid, ServiceTileFlags>,
    webhook_events: HashMap<Uuid, WebhookEvent>,
    disputes: HashMap<String, DisputeRecord>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
    fail_entity_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_merchant(&self, merchant: Merchant) {
        self.state
            .write()
            .await
            .merchants
            .insert(merchant.id, merchant);
    }

    pub async fn insert_payment_method(&self, method: StoredPaymentMethod) {
        self.state
            .write()
            .await
            .payment_methods
            .insert(method.id, method);
    }

    pub async fn insert_entity(&self, entity_type: EntityType, entity_id: Uuid, status: &str) {
        self.state.write().await.entities.insert(
            EntityRef {
                entity_type,
                entity_id,
            },
            MemoryEntity::new(status),
        );
    }

    pub async fn insert_service_application(
        &self,
        application_id: Uuid,
        status: &str,
        tile_id: Uuid,
        flags: ServiceTileFlags,
    ) {
        let mut state = self.state.write().await;
        let mut entity = MemoryEntity::new(status);
        entity.tile_id = Some(tile_id);
        state.entities.insert(
            EntityRef {
                entity_type: EntityType::ServiceApplication,
                entity_id: application_id,
            },
            entity,
        );
        state.tiles.insert(tile_id, flags);
    }

    /// Makes every entity write fail, to exercise best-effort fulfillment.
    pub fn fail_entity_writes(&self, fail: bool) {
        self.fail_entity_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn entity(&self, entity: EntityRef) -> Option<MemoryEntity> {
        self.state.read().await.entities.get(&entity).cloned()
    }

    pub async fn merchant(&self, id: Uuid) -> Option<Merchant> {
        self.state.read().await.merchants.get(&id).cloned()
    }

    pub async fn payment_method(&self, id: Uuid) -> Option<StoredPaymentMethod> {
        self.state.read().await.payment_methods.get(&id).cloned()
    }

    pub async fn transactions(&self) -> Vec<PaymentTransaction> {
        self.state
            .read()
            .await
            .transactions
            .values()
            .cloned()
            .collect()
    }

    pub async fn webhook_events(&self) -> Vec<WebhookEvent> {
        self.state
            .read()
            .await
            .webhook_events
            .values()
            .cloned()
            .collect()
    }

    pub async fn dispute(&self, finix_dispute_id: &str) -> Option<DisputeRecord> {
        self.state
            .read()
            .await
            .disputes
            .get(finix_dispute_id)
            .cloned()
    }

    fn check_entity_writes(&self) -> Result<(), DatabaseError> {
        if self.fail_entity_writes.load(Ordering::SeqCst) {
            return Err(DatabaseError::new(DatabaseErrorKind::ConnectionFailed {
                message: "entity writes disabled".to_string(),
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for InMemoryStore {
    async fn insert(
        &self,
        new: &NewPaymentTransaction,
    ) -> Result<PaymentTransaction, DatabaseError> {
        let mut state = self.state.write().await;
        if state
            .transactions
            .values()
            .any(|tx| tx.idempotency_key == new.idempotency_key)
        {
            return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                constraint: Some("payment_transactions_idempotency_key_key".to_string()),
            }));
        }
        if new.total_amount_cents != new.base_amount_cents + new.service_fee_cents {
            return Err(DatabaseError::new(DatabaseErrorKind::CheckViolation {
                constraint: Some("payment_transactions_total_check".to_string()),
            }));
        }

        let now = Utc::now();
        let tx = PaymentTransaction {
            id: Uuid::new_v4(),
            idempotency_key: new.idempotency_key.clone(),
            idempotency_metadata: new.idempotency_metadata.clone(),
            entity_type: new.entity_type,
            entity_id: new.entity_id,
            merchant_id: new.merchant_id,
            user_id: new.user_id,
            customer_id: new.customer_id.clone(),
            base_amount_cents: new.base_amount_cents,
            service_fee_cents: new.service_fee_cents,
            total_amount_cents: new.total_amount_cents,
            refunded_amount_cents: 0,
            currency: new.currency.clone(),
            payment_type: new.payment_type.clone(),
            finix_payment_instrument_id: new.finix_payment_instrument_id.clone(),
            card_brand: new.card_brand.clone(),
            card_last_four: new.card_last_four.clone(),
            bank_last_four: new.bank_last_four.clone(),
            payment_status: PaymentStatus::Unpaid,
            transfer_state: TransferState::Pending,
            finix_transfer_id: None,
            raw_finix_response: None,
            failure_reason: None,
            fraud_session_id: new.fraud_session_id.clone(),
            customer_email: new.customer_email.clone(),
            last_webhook_event_id: None,
            last_webhook_at: None,
            paid_at: None,
            created_at: now,
            updated_at: now,
        };
        state.transactions.insert(tx.id, tx.clone());
        Ok(tx)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentTransaction>, DatabaseError> {
        Ok(self.state.read().await.transactions.get(&id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<PaymentTransaction>, DatabaseError> {
        Ok(self
            .state
            .read()
            .await
            .transactions
            .values()
            .find(|tx| tx.idempotency_key == key)
            .cloned())
    }

    async fn find_by_transfer_id(
        &self,
        finix_transfer_id: &str,
    ) -> Result<Option<PaymentTransaction>, DatabaseError> {
        Ok(self
            .state
            .read()
            .await
            .transactions
            .values()
            .find(|tx| tx.finix_transfer_id.as_deref() == Some(finix_transfer_id))
            .cloned())
    }

    async fn apply_status(
        &self,
        update: &TransactionStatusUpdate,
    ) -> Result<Option<PaymentTransaction>, DatabaseError> {
        let mut state = self.state.write().await;
        let Some(tx) = state.transactions.get_mut(&update.transaction_id) else {
            return Ok(None);
        };
        if tx.payment_status != PaymentStatus::Unpaid {
            return Ok(None);
        }
        if let (Some(occurred), Some(last_seen)) = (update.webhook_occurred_at, tx.last_webhook_at)
        {
            if last_seen > occurred {
                return Ok(None);
            }
        }

        let now = Utc::now();
        tx.payment_status = update.payment_status;
        tx.transfer_state = update.transfer_state;
        if let Some(transfer_id) = &update.finix_transfer_id {
            tx.finix_transfer_id = Some(transfer_id.clone());
        }
        if let Some(instrument_id) = &update.finix_payment_instrument_id {
            tx.finix_payment_instrument_id = instrument_id.clone();
        }
        if let Some(raw) = &update.raw_finix_response {
            tx.raw_finix_response = Some(raw.clone());
        }
        if let Some(reason) = &update.failure_reason {
            tx.failure_reason = Some(reason.clone());
        }
        if let Some(event_id) = &update.webhook_event_id {
            tx.last_webhook_event_id = Some(event_id.clone());
        }
        if let Some(occurred) = update.webhook_occurred_at {
            tx.last_webhook_at = Some(occurred);
        }
        if update.payment_status == PaymentStatus::Paid {
            tx.paid_at = Some(now);
        }
        tx.updated_at = now;
        Ok(Some(tx.clone()))
    }

    async fn delete_unsent(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let mut state = self.state.write().await;
        let deletable = state.transactions.get(&id).is_some_and(|tx| {
            tx.finix_transfer_id.is_none() && tx.payment_status == PaymentStatus::Unpaid
        });
        if deletable {
            state.transactions.remove(&id);
        }
        Ok(deletable)
    }

    async fn add_refund(
        &self,
        id: Uuid,
        amount_cents: i64,
    ) -> Result<Option<PaymentTransaction>, DatabaseError> {
        let mut state = self.state.write().await;
        let Some(tx) = state.transactions.get_mut(&id) else {
            return Ok(None);
        };
        if tx.payment_status != PaymentStatus::Paid
            || tx.refunded_amount_cents + amount_cents > tx.total_amount_cents
        {
            return Ok(None);
        }
        tx.refunded_amount_cents += amount_cents;
        tx.updated_at = Utc::now();
        Ok(Some(tx.clone()))
    }
}

#[async_trait]
impl MerchantStore for InMemoryStore {
    async fn find_by_id(&self, merchant_id: Uuid) -> Result<Option<Merchant>, DatabaseError> {
        Ok(self.state.read().await.merchants.get(&merchant_id).cloned())
    }

    async fn apply_processor_update(
        &self,
        update: &MerchantProcessorUpdate,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.state.write().await;
        let Some(merchant) = state
            .merchants
            .values_mut()
            .find(|m| m.finix_merchant_id.as_deref() == Some(update.finix_merchant_id.as_str()))
        else {
            return Ok(false);
        };
        if let Some(onboarding_state) = &update.onboarding_state {
            merchant.onboarding_state = Some(onboarding_state.clone());
        }
        if let Some(enabled) = update.processing_enabled {
            merchant.processing_enabled = enabled;
        }
        if merchant.finix_identity_id.is_none() {
            merchant.finix_identity_id = update.finix_identity_id.clone();
        }
        merchant.updated_at = Utc::now();
        Ok(true)
    }

    async fn touch_identity(&self, finix_identity_id: &str) -> Result<bool, DatabaseError> {
        let mut state = self.state.write().await;
        let mut touched = false;
        for merchant in state
            .merchants
            .values_mut()
            .filter(|m| m.finix_identity_id.as_deref() == Some(finix_identity_id))
        {
            merchant.updated_at = Utc::now();
            touched = true;
        }
        Ok(touched)
    }
}

#[async_trait]
impl PaymentMethodStore for InMemoryStore {
    async fn find_for_user(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<StoredPaymentMethod>, DatabaseError> {
        Ok(self
            .state
            .read()
            .await
            .payment_methods
            .get(&id)
            .filter(|m| m.user_id == user_id)
            .cloned())
    }

    async fn set_enabled_by_processor_id(
        &self,
        finix_payment_instrument_id: &str,
        enabled: bool,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.state.write().await;
        let mut updated = false;
        for method in state
            .payment_methods
            .values_mut()
            .filter(|m| m.finix_payment_instrument_id == finix_payment_instrument_id)
        {
            method.is_enabled = enabled;
            method.updated_at = Utc::now();
            updated = true;
        }
        Ok(updated)
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn record_payment(&self, update: &EntityPaymentUpdate) -> Result<bool, DatabaseError> {
        self.check_entity_writes()?;
        let mut state = self.state.write().await;
        let Some(entity) = state.entities.get_mut(&update.entity) else {
            return Ok(false);
        };
        if entity.payment_status == "paid" {
            return Ok(false);
        }
        entity.payment_status = "paid".to_string();
        entity.total_amount_cents = Some(update.total_amount_cents);
        entity.service_fee_cents = Some(update.service_fee_cents);
        entity.payment_transaction_id = Some(update.transaction_id);
        entity.finix_transfer_id = update.finix_transfer_id.clone();
        entity.finix_payment_instrument_id = Some(update.finix_payment_instrument_id.clone());
        entity.payment_processed_at = Some(update.processed_at);
        if update.entity.entity_type.records_fee_snapshot() && update.fee_snapshot.is_some() {
            entity.merchant_fee_snapshot = update.fee_snapshot.clone();
        }
        entity.payment_writes += 1;
        Ok(true)
    }

    async fn current_status(&self, entity: EntityRef) -> Result<Option<String>, DatabaseError> {
        Ok(self
            .state
            .read()
            .await
            .entities
            .get(&entity)
            .map(|e| e.status.clone()))
    }

    async fn advance_status(
        &self,
        entity: EntityRef,
        expected: &str,
        target: &str,
        stamp_issued_at: bool,
    ) -> Result<bool, DatabaseError> {
        self.check_entity_writes()?;
        let mut state = self.state.write().await;
        let Some(row) = state.entities.get_mut(&entity) else {
            return Ok(false);
        };
        if row.status != expected {
            return Ok(false);
        }
        row.status = target.to_string();
        if stamp_issued_at {
            row.issued_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn service_tile_flags(
        &self,
        application_id: Uuid,
    ) -> Result<Option<ServiceTileFlags>, DatabaseError> {
        let state = self.state.read().await;
        let tile_id = state
            .entities
            .get(&EntityRef {
                entity_type: EntityType::ServiceApplication,
                entity_id: application_id,
            })
            .and_then(|e| e.tile_id);
        Ok(tile_id.and_then(|id| state.tiles.get(&id).copied()))
    }
}

#[async_trait]
impl WebhookStore for InMemoryStore {
    async fn log_event(
        &self,
        event_id: &str,
        event_type: &str,
        entity: &str,
        payload: &JsonValue,
    ) -> Result<WebhookEvent, DatabaseError> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .webhook_events
            .values_mut()
            .find(|e| e.event_id == event_id)
        {
            existing.delivery_count += 1;
            return Ok(existing.clone());
        }

        let event = WebhookEvent {
            id: Uuid::new_v4(),
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            entity: entity.to_string(),
            payload: payload.clone(),
            status: WebhookEventStatus::Received,
            delivery_count: 1,
            retry_count: 0,
            last_error: None,
            received_at: Utc::now(),
            processed_at: None,
        };
        state.webhook_events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn mark_processed(&self, id: Uuid) -> Result<(), DatabaseError> {
        let mut state = self.state.write().await;
        let event = state
            .webhook_events
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("webhook_event", id.to_string()))?;
        event.status = WebhookEventStatus::Processed;
        event.processed_at = Some(Utc::now());
        event.last_error = None;
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        let mut state = self.state.write().await;
        let event = state
            .webhook_events
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("webhook_event", id.to_string()))?;
        event.status = WebhookEventStatus::Failed;
        event.retry_count += 1;
        event.last_error = Some(error.to_string());
        Ok(())
    }

    async fn get_failed_events(
        &self,
        limit: i64,
        max_retries: i32,
    ) -> Result<Vec<WebhookEvent>, DatabaseError> {
        let state = self.state.read().await;
        let mut failed: Vec<WebhookEvent> = state
            .webhook_events
            .values()
            .filter(|e| e.status == WebhookEventStatus::Failed && e.retry_count < max_retries)
            .cloned()
            .collect();
        failed.sort_by_key(|e| e.received_at);
        failed.truncate(limit.max(0) as usize);
        Ok(failed)
    }

    async fn upsert_dispute(&self, dispute: &DisputeRecord) -> Result<(), DatabaseError> {
        let mut state = self.state.write().await;
        match state.disputes.get_mut(&dispute.finix_dispute_id) {
            Some(existing) => {
                existing.state = dispute.state.clone().or(existing.state.take());
                existing.reason = dispute.reason.clone().or(existing.reason.take());
                existing.amount_cents = dispute.amount_cents.or(existing.amount_cents);
                existing.respond_by = dispute.respond_by.or(existing.respond_by);
                existing.transaction_id = dispute.transaction_id.or(existing.transaction_id);
            }
            None => {
                state
                    .disputes
                    .insert(dispute.finix_dispute_id.clone(), dispute.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_tx(key: &str) -> NewPaymentTransaction {
        NewPaymentTransaction {
            idempotency_key: key.to_string(),
            idempotency_metadata: serde_json::json!({}),
            entity_type: EntityType::Permit,
            entity_id: Uuid::new_v4(),
            merchant_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            customer_id: None,
            base_amount_cents: 10_000,
            service_fee_cents: 320,
            total_amount_cents: 10_320,
            currency: "USD".to_string(),
            payment_type: "card".to_string(),
            finix_payment_instrument_id: "PI1".to_string(),
            card_brand: None,
            card_last_four: None,
            bank_last_four: None,
            fraud_session_id: None,
            customer_email: None,
        }
    }

    #[tokio::test]
    async fn duplicate_key_is_a_unique_violation() {
        let store = InMemoryStore::new();
        store.insert(&new_tx("key_1")).await.unwrap();
        let err = store.insert(&new_tx("key_1")).await.unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn paid_row_is_not_updated_again() {
        let store = InMemoryStore::new();
        let tx = store.insert(&new_tx("key_2")).await.unwrap();

        let mut paid = TransactionStatusUpdate::new(tx.id, TransferState::Succeeded);
        paid.finix_transfer_id = Some("TR1".to_string());
        assert!(store.apply_status(&paid).await.unwrap().is_some());

        let failed = TransactionStatusUpdate::new(tx.id, TransferState::Failed);
        assert!(store.apply_status(&failed).await.unwrap().is_none());

        let current = TransactionStore::find_by_id(&store, tx.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.payment_status, PaymentStatus::Paid);
        assert!(!store.delete_unsent(tx.id).await.unwrap());
    }

    #[tokio::test]
    async fn refund_cannot_exceed_total() {
        let store = InMemoryStore::new();
        let tx = store.insert(&new_tx("key_3")).await.unwrap();
        assert!(store.add_refund(tx.id, 100).await.unwrap().is_none());

        store
            .apply_status(&TransactionStatusUpdate::new(tx.id, TransferState::Succeeded))
            .await
            .unwrap();
        assert!(store.add_refund(tx.id, 10_000).await.unwrap().is_some());
        assert!(store.add_refund(tx.id, 321).await.unwrap().is_none());
        assert!(store.add_refund(tx.id, 320).await.unwrap().is_some());
    }
}
