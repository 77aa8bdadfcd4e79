use crate::database::entity_repository::EntityType;
use crate::database::error::DatabaseError;
use crate::payments::types::TransferState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Payment status as seen by the bill-pay UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
        }
    }

    /// Ledger status implied by a processor transfer state.
    pub fn for_transfer_state(state: TransferState) -> Self {
        match state {
            TransferState::Succeeded => PaymentStatus::Paid,
            TransferState::Failed | TransferState::Canceled => PaymentStatus::Failed,
            TransferState::Pending => PaymentStatus::Unpaid,
        }
    }
}

/// Ledger row for one payment attempt
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub idempotency_key: String,
    pub idempotency_metadata: JsonValue,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub merchant_id: Uuid,
    pub user_id: Uuid,
    pub customer_id: Option<String>,
    pub base_amount_cents: i64,
    pub service_fee_cents: i64,
    pub total_amount_cents: i64,
    pub refunded_amount_cents: i64,
    pub currency: String,
    pub payment_type: String,
    pub finix_payment_instrument_id: String,
    pub card_brand: Option<String>,
    pub card_last_four: Option<String>,
    pub bank_last_four: Option<String>,
    pub payment_status: PaymentStatus,
    pub transfer_state: TransferState,
    pub finix_transfer_id: Option<String>,
    pub raw_finix_response: Option<JsonValue>,
    pub failure_reason: Option<String>,
    pub fraud_session_id: Option<String>,
    pub customer_email: Option<String>,
    pub last_webhook_event_id: Option<String>,
    pub last_webhook_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentTransaction {
    pub fn refundable_cents(&self) -> i64 {
        (self.total_amount_cents - self.refunded_amount_cents).max(0)
    }
}

/// Fully computed row to insert; fee and total are already frozen.
#[derive(Debug, Clone)]
pub struct NewPaymentTransaction {
    pub idempotency_key: String,
    pub idempotency_metadata: JsonValue,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub merchant_id: Uuid,
    pub user_id: Uuid,
    pub customer_id: Option<String>,
    pub base_amount_cents: i64,
    pub service_fee_cents: i64,
    pub total_amount_cents: i64,
    pub currency: String,
    pub payment_type: String,
    pub finix_payment_instrument_id: String,
    pub card_brand: Option<String>,
    pub card_last_four: Option<String>,
    pub bank_last_four: Option<String>,
    pub fraud_session_id: Option<String>,
    pub customer_email: Option<String>,
}

/// Status change applied from the orchestrator or a webhook.
#[derive(Debug, Clone)]
pub struct TransactionStatusUpdate {
    pub transaction_id: Uuid,
    pub payment_status: PaymentStatus,
    pub transfer_state: TransferState,
    pub finix_transfer_id: Option<String>,
    pub finix_payment_instrument_id: Option<String>,
    pub raw_finix_response: Option<JsonValue>,
    pub failure_reason: Option<String>,
    pub webhook_event_id: Option<String>,
    pub webhook_occurred_at: Option<DateTime<Utc>>,
}

impl TransactionStatusUpdate {
    pub fn new(transaction_id: Uuid, transfer_state: TransferState) -> Self {
        Self {
            transaction_id,
            payment_status: PaymentStatus::for_transfer_state(transfer_state),
            transfer_state,
            finix_transfer_id: None,
            finix_payment_instrument_id: None,
            raw_finix_response: None,
            failure_reason: None,
            webhook_event_id: None,
            webhook_occurred_at: None,
        }
    }
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Fails with a unique violation when the idempotency key already exists.
    async fn insert(
        &self,
        new: &NewPaymentTransaction,
    ) -> Result<PaymentTransaction, DatabaseError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentTransaction>, DatabaseError>;

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<PaymentTransaction>, DatabaseError>;

    async fn find_by_transfer_id(
        &self,
        finix_transfer_id: &str,
    ) -> Result<Option<PaymentTransaction>, DatabaseError>;

    /// Applies the update only while the row is still `unpaid` and the update
    /// is not older than the last webhook seen. Returns `None` if the guard
    /// rejected it.
    async fn apply_status(
        &self,
        update: &TransactionStatusUpdate,
    ) -> Result<Option<PaymentTransaction>, DatabaseError>;

    /// Deletes the row only if it is `unpaid` and was never linked to a transfer.
    async fn delete_unsent(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Adds to the refunded total if the row is paid and stays within its total.
    async fn add_refund(
        &self,
        id: Uuid,
        amount_cents: i64,
    ) -> Result<Option<PaymentTransaction>, DatabaseError>;
}

pub struct PgTransactionStore {
    pool: PgPool,
}

const TRANSACTION_COLUMNS: &str = "id, idempotency_key, idempotency_metadata, entity_type, entity_id,
    merchant_id, user_id, customer_id, base_amount_cents, service_fee_cents, total_amount_cents,
    refunded_amount_cents, currency, payment_type, finix_payment_instrument_id, card_brand,
    card_last_four, bank_last_four, payment_status, transfer_state, finix_transfer_id,
    raw_finix_response, failure_reason, fraud_session_id, customer_email, last_webhook_event_id,
    last_webhook_at, paid_at, created_at, updated_at";

impl PgTransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_where(
        &self,
        predicate: &str,
        value: impl for<'q> sqlx::Encode<'q, sqlx::Postgres> + sqlx::Type<sqlx::Postgres> + Send + 'static,
    ) -> Result<Option<PaymentTransaction>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM payment_transactions WHERE {}",
            TRANSACTION_COLUMNS, predicate
        );
        sqlx::query_as::<_, PaymentTransaction>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn insert(
        &self,
        new: &NewPaymentTransaction,
    ) -> Result<PaymentTransaction, DatabaseError> {
        let sql = format!(
            "INSERT INTO payment_transactions
             (idempotency_key, idempotency_metadata, entity_type, entity_id, merchant_id, user_id,
              customer_id, base_amount_cents, service_fee_cents, total_amount_cents, currency,
              payment_type, finix_payment_instrument_id, card_brand, card_last_four,
              bank_last_four, fraud_session_id, customer_email, payment_status, transfer_state)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
                     'unpaid', 'PENDING')
             RETURNING {}",
            TRANSACTION_COLUMNS
        );

        sqlx::query_as::<_, PaymentTransaction>(&sql)
            .bind(&new.idempotency_key)
            .bind(&new.idempotency_metadata)
            .bind(new.entity_type)
            .bind(new.entity_id)
            .bind(new.merchant_id)
            .bind(new.user_id)
            .bind(&new.customer_id)
            .bind(new.base_amount_cents)
            .bind(new.service_fee_cents)
            .bind(new.total_amount_cents)
            .bind(&new.currency)
            .bind(&new.payment_type)
            .bind(&new.finix_payment_instrument_id)
            .bind(&new.card_brand)
            .bind(&new.card_last_four)
            .bind(&new.bank_last_four)
            .bind(&new.fraud_session_id)
            .bind(&new.customer_email)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentTransaction>, DatabaseError> {
        self.find_where("id = $1", id).await
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<PaymentTransaction>, DatabaseError> {
        self.find_where("idempotency_key = $1", key.to_string()).await
    }

    async fn find_by_transfer_id(
        &self,
        finix_transfer_id: &str,
    ) -> Result<Option<PaymentTransaction>, DatabaseError> {
        self.find_where("finix_transfer_id = $1", finix_transfer_id.to_string())
            .await
    }

    async fn apply_status(
        &self,
        update: &TransactionStatusUpdate,
    ) -> Result<Option<PaymentTransaction>, DatabaseError> {
        let sql = format!(
            "UPDATE payment_transactions
             SET payment_status = $2,
                 transfer_state = $3,
                 finix_transfer_id = COALESCE($4, finix_transfer_id),
                 finix_payment_instrument_id = COALESCE($5, finix_payment_instrument_id),
                 raw_finix_response = COALESCE($6, raw_finix_response),
                 failure_reason = COALESCE($7, failure_reason),
                 last_webhook_event_id = COALESCE($8, last_webhook_event_id),
                 last_webhook_at = COALESCE($9, last_webhook_at),
                 paid_at = CASE WHEN $2 = 'paid' THEN NOW() ELSE paid_at END,
                 updated_at = NOW()
             WHERE id = $1
               AND payment_status = 'unpaid'
               AND ($9::timestamptz IS NULL OR last_webhook_at IS NULL OR last_webhook_at <= $9)
             RETURNING {}",
            TRANSACTION_COLUMNS
        );

        sqlx::query_as::<_, PaymentTransaction>(&sql)
            .bind(update.transaction_id)
            .bind(update.payment_status)
            .bind(update.transfer_state)
            .bind(&update.finix_transfer_id)
            .bind(&update.finix_payment_instrument_id)
            .bind(&update.raw_finix_response)
            .bind(&update.failure_reason)
            .bind(&update.webhook_event_id)
            .bind(update.webhook_occurred_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn delete_unsent(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "DELETE FROM payment_transactions
             WHERE id = $1 AND finix_transfer_id IS NULL AND payment_status = 'unpaid'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() > 0)
    }

    async fn add_refund(
        &self,
        id: Uuid,
        amount_cents: i64,
    ) -> Result<Option<PaymentTransaction>, DatabaseError> {
        let sql = format!(
            "UPDATE payment_transactions
             SET refunded_amount_cents = refunded_amount_cents + $2,
                 updated_at = NOW()
             WHERE id = $1
               AND payment_status = 'paid'
               AND refunded_amount_cents + $2 <= total_amount_cents
             RETURNING {}",
            TRANSACTION_COLUMNS
        );

        sqlx::query_as::<_, PaymentTransaction>(&sql)
            .bind(id)
            .bind(amount_cents)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_status_follows_transfer_state() {
        assert_eq!(
            PaymentStatus::for_transfer_state(TransferState::Succeeded),
            PaymentStatus::Paid
        );
        assert_eq!(
            PaymentStatus::for_transfer_state(TransferState::Canceled),
            PaymentStatus::Failed
        );
        assert_eq!(
            PaymentStatus::for_transfer_state(TransferState::Pending),
            PaymentStatus::Unpaid
        );
    }

    #[test]
    fn status_update_defaults_from_state() {
        let update = TransactionStatusUpdate::new(Uuid::new_v4(), TransferState::Failed);
        assert_eq!(update.payment_status, PaymentStatus::Failed);
        assert!(update.finix_transfer_id.is_none());
    }
}
