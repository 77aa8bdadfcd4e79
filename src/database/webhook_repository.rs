use crate::database::error::DatabaseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Received,
    Processed,
    Failed,
}

/// Audit-log row for one processor event
#[derive(Debug, Clone, FromRow)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub event_id: String,
    pub event_type: String,
    pub entity: String,
    pub payload: JsonValue,
    pub status: WebhookEventStatus,
    pub delivery_count: i32,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct DisputeRecord {
    pub finix_dispute_id: String,
    pub finix_transfer_id: Option<String>,
    pub state: Option<String>,
    pub reason: Option<String>,
    pub amount_cents: Option<i64>,
    pub respond_by: Option<DateTime<Utc>>,
    pub transaction_id: Option<Uuid>,
}

#[async_trait]
pub trait WebhookStore: Send + Sync {
    /// Records the delivery. A redelivered event id returns the existing row
    /// with its delivery count bumped.
    async fn log_event(
        &self,
        event_id: &str,
        event_type: &str,
        entity: &str,
        payload: &JsonValue,
    ) -> Result<WebhookEvent, DatabaseError>;

    async fn mark_processed(&self, id: Uuid) -> Result<(), DatabaseError>;

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<(), DatabaseError>;

    /// Failed events still under the retry ceiling, oldest first.
    async fn get_failed_events(
        &self,
        limit: i64,
        max_retries: i32,
    ) -> Result<Vec<WebhookEvent>, DatabaseError>;

    async fn upsert_dispute(&self, dispute: &DisputeRecord) -> Result<(), DatabaseError>;
}

pub struct PgWebhookStore {
    pool: PgPool,
}

impl PgWebhookStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookStore for PgWebhookStore {
    async fn log_event(
        &self,
        event_id: &str,
        event_type: &str,
        entity: &str,
        payload: &JsonValue,
    ) -> Result<WebhookEvent, DatabaseError> {
        sqlx::query_as::<_, WebhookEvent>(
            "INSERT INTO finix_webhook_events (event_id, event_type, entity, payload, status)
             VALUES ($1, $2, $3, $4, 'received')
             ON CONFLICT (event_id)
             DO UPDATE SET delivery_count = finix_webhook_events.delivery_count + 1
             RETURNING id, event_id, event_type, entity, payload, status, delivery_count,
                       retry_count, last_error, received_at, processed_at",
        )
        .bind(event_id)
        .bind(event_type)
        .bind(entity)
        .bind(payload)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn mark_processed(&self, id: Uuid) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE finix_webhook_events
             SET status = 'processed', processed_at = NOW(), last_error = NULL
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE finix_webhook_events
             SET status = 'failed', retry_count = retry_count + 1, last_error = $2
             WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn get_failed_events(
        &self,
        limit: i64,
        max_retries: i32,
    ) -> Result<Vec<WebhookEvent>, DatabaseError> {
        sqlx::query_as::<_, WebhookEvent>(
            "SELECT id, event_id, event_type, entity, payload, status, delivery_count,
                    retry_count, last_error, received_at, processed_at
             FROM finix_webhook_events
             WHERE status = 'failed' AND retry_count < $2
             ORDER BY received_at ASC
             LIMIT $1",
        )
        .bind(limit)
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn upsert_dispute(&self, dispute: &DisputeRecord) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO finix_disputes
             (finix_dispute_id, finix_transfer_id, state, reason, amount_cents, respond_by,
              payment_transaction_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (finix_dispute_id) DO UPDATE SET
                 state = COALESCE(EXCLUDED.state, finix_disputes.state),
                 reason = COALESCE(EXCLUDED.reason, finix_disputes.reason),
                 amount_cents = COALESCE(EXCLUDED.amount_cents, finix_disputes.amount_cents),
                 respond_by = COALESCE(EXCLUDED.respond_by, finix_disputes.respond_by),
                 payment_transaction_id = COALESCE(EXCLUDED.payment_transaction_id,
                                                   finix_disputes.payment_transaction_id),
                 updated_at = NOW()",
        )
        .bind(&dispute.finix_dispute_id)
        .bind(&dispute.finix_transfer_id)
        .bind(&dispute.state)
        .bind(&dispute.reason)
        .bind(dispute.amount_cents)
        .bind(dispute.respond_by)
        .bind(dispute.transaction_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }
}
