//! Durable record of payment attempts.
//!
//! The ledger is the only place that decides whether a charge happened. Rows
//! are created `unpaid` before any money moves, flipped to a terminal status
//! at most once, and deleted only while no transfer id has been recorded.

use crate::database::entity_repository::EntityRef;
use crate::database::error::DatabaseError;
use crate::database::transaction_repository::{
    NewPaymentTransaction, PaymentTransaction, TransactionStatusUpdate, TransactionStore,
};
use crate::services::fee_calculation::{classify_payment_type, compute_fee, MerchantFeeSchedule};
use crate::services::idempotency::{IdempotencyMetadata, OperationKey};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("operation key {operation_key} already recorded")]
    DuplicateKey { operation_key: String },

    #[error("transaction {0} not found")]
    NotFound(Uuid),

    #[error("transaction {transaction_id} is linked to a transfer and cannot be deleted")]
    RollbackRefused { transaction_id: Uuid },

    #[error(transparent)]
    Persistence(#[from] DatabaseError),
}

impl LedgerError {
    fn validation(field: &str, message: impl Into<String>) -> Self {
        LedgerError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::Persistence(err) => err.is_retryable(),
            _ => false,
        }
    }
}

/// Inputs for a new attempt. Fee and total are computed by the ledger.
#[derive(Debug, Clone)]
pub struct PendingTransaction {
    pub operation_key: OperationKey,
    pub metadata: IdempotencyMetadata,
    pub entity: EntityRef,
    pub merchant_id: Uuid,
    pub user_id: Uuid,
    pub customer_id: Option<String>,
    pub base_amount_cents: i64,
    pub currency: String,
    pub payment_type: String,
    pub finix_payment_instrument_id: String,
    pub card_brand: Option<String>,
    pub card_last_four: Option<String>,
    pub bank_last_four: Option<String>,
    pub fraud_session_id: Option<String>,
    pub customer_email: Option<String>,
}

/// What `update_status` did with a requested change.
#[derive(Debug, Clone)]
pub enum StatusUpdateOutcome {
    Applied(PaymentTransaction),
    /// The row already carried the requested status
    AlreadyApplied(PaymentTransaction),
    /// The row is terminal in a different state, or the update was stale
    Rejected(PaymentTransaction),
}

impl StatusUpdateOutcome {
    pub fn transaction(&self) -> &PaymentTransaction {
        match self {
            StatusUpdateOutcome::Applied(tx)
            | StatusUpdateOutcome::AlreadyApplied(tx)
            | StatusUpdateOutcome::Rejected(tx) => tx,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, StatusUpdateOutcome::Applied(_))
    }
}

pub struct TransactionLedger {
    store: Arc<dyn TransactionStore>,
    max_total_cents: i64,
}

impl TransactionLedger {
    pub fn new(store: Arc<dyn TransactionStore>, max_total_cents: i64) -> Self {
        Self {
            store,
            max_total_cents,
        }
    }

    /// Validates, freezes the fee and inserts the row in one statement.
    pub async fn create_pending(
        &self,
        params: PendingTransaction,
        schedule: &MerchantFeeSchedule,
    ) -> Result<PaymentTransaction, LedgerError> {
        if params.base_amount_cents <= 0 {
            return Err(LedgerError::validation(
                "base_amount_cents",
                "amount must be positive",
            ));
        }
        if params.base_amount_cents > self.max_total_cents {
            return Err(LedgerError::validation(
                "base_amount_cents",
                format!(
                    "base of {} cents exceeds the per-transaction limit of {} cents",
                    params.base_amount_cents, self.max_total_cents
                ),
            ));
        }
        if params.finix_payment_instrument_id.trim().is_empty() {
            return Err(LedgerError::validation(
                "payment_instrument_id",
                "payment instrument is required",
            ));
        }
        if params.entity.entity_id.is_nil() {
            return Err(LedgerError::validation("entity_id", "entity id is required"));
        }
        if params.merchant_id.is_nil() {
            return Err(LedgerError::validation(
                "merchant_id",
                "merchant id is required",
            ));
        }

        let class = classify_payment_type(&params.payment_type);
        let fee = compute_fee(params.base_amount_cents, class.is_card(), schedule)
            .map_err(|e| LedgerError::validation("base_amount_cents", e.to_string()))?;
        if fee.fee_cents < 0 {
            return Err(LedgerError::validation(
                "service_fee_cents",
                "merchant fee schedule produced a negative fee",
            ));
        }
        if fee.total_cents > self.max_total_cents {
            return Err(LedgerError::validation(
                "total_amount_cents",
                format!(
                    "total of {} cents exceeds the per-transaction limit of {} cents",
                    fee.total_cents, self.max_total_cents
                ),
            ));
        }

        let new = NewPaymentTransaction {
            idempotency_key: params.operation_key.as_str().to_string(),
            idempotency_metadata: params.metadata.to_json(),
            entity_type: params.entity.entity_type,
            entity_id: params.entity.entity_id,
            merchant_id: params.merchant_id,
            user_id: params.user_id,
            customer_id: params.customer_id,
            base_amount_cents: fee.base_amount_cents,
            service_fee_cents: fee.fee_cents,
            total_amount_cents: fee.total_cents,
            currency: params.currency,
            payment_type: params.payment_type,
            finix_payment_instrument_id: params.finix_payment_instrument_id,
            card_brand: params.card_brand,
            card_last_four: params.card_last_four,
            bank_last_four: params.bank_last_four,
            fraud_session_id: params.fraud_session_id,
            customer_email: params.customer_email,
        };

        match self.store.insert(&new).await {
            Ok(tx) => {
                info!(
                    transaction_id = %tx.id,
                    operation_key = %tx.idempotency_key,
                    total_amount_cents = tx.total_amount_cents,
                    "pending transaction created"
                );
                Ok(tx)
            }
            Err(err) if err.is_unique_violation() => Err(LedgerError::DuplicateKey {
                operation_key: new.idempotency_key,
            }),
            Err(err) if err.is_bad_input() => {
                Err(LedgerError::validation("transaction", err.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn find_by_operation_key(
        &self,
        key: &OperationKey,
    ) -> Result<Option<PaymentTransaction>, LedgerError> {
        Ok(self.store.find_by_idempotency_key(key.as_str()).await?)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentTransaction>, LedgerError> {
        Ok(self.store.find_by_id(id).await?)
    }

    pub async fn find_by_transfer_id(
        &self,
        transfer_id: &str,
    ) -> Result<Option<PaymentTransaction>, LedgerError> {
        Ok(self.store.find_by_transfer_id(transfer_id).await?)
    }

    /// Applying a state the row already has is a no-op. A paid row is never
    /// moved to any other state.
    pub async fn update_status(
        &self,
        update: &TransactionStatusUpdate,
    ) -> Result<StatusUpdateOutcome, LedgerError> {
        if let Some(tx) = self.store.apply_status(update).await? {
            debug!(
                transaction_id = %tx.id,
                payment_status = tx.payment_status.as_str(),
                transfer_state = tx.transfer_state.as_str(),
                "transaction status applied"
            );
            return Ok(StatusUpdateOutcome::Applied(tx));
        }

        let current = self
            .store
            .find_by_id(update.transaction_id)
            .await?
            .ok_or(LedgerError::NotFound(update.transaction_id))?;

        if current.payment_status == update.payment_status
            && current.transfer_state == update.transfer_state
        {
            Ok(StatusUpdateOutcome::AlreadyApplied(current))
        } else {
            warn!(
                transaction_id = %current.id,
                current_status = current.payment_status.as_str(),
                requested_status = update.payment_status.as_str(),
                "transaction status change rejected"
            );
            Ok(StatusUpdateOutcome::Rejected(current))
        }
    }

    /// Hard-deletes an attempt that never reached a transfer. Deleting a row
    /// that is already gone succeeds.
    pub async fn rollback(&self, transaction_id: Uuid) -> Result<(), LedgerError> {
        if self.store.delete_unsent(transaction_id).await? {
            warn!(transaction_id = %transaction_id, "pending transaction rolled back");
            return Ok(());
        }
        match self.store.find_by_id(transaction_id).await? {
            None => Ok(()),
            Some(_) => Err(LedgerError::RollbackRefused { transaction_id }),
        }
    }

    pub async fn record_refund(
        &self,
        transaction_id: Uuid,
        amount_cents: i64,
    ) -> Result<Option<PaymentTransaction>, LedgerError> {
        Ok(self.store.add_refund(transaction_id, amount_cents).await?)
    }
}
