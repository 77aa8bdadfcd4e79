use crate::database::error::DatabaseError;
use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// A stored, processor-tokenized instrument belonging to a user
#[derive(Debug, Clone, FromRow)]
pub struct StoredPaymentMethod {
    pub id: Uuid,
    pub user_id: Uuid,
    pub finix_payment_instrument_id: String,
    pub method_type: String,
    pub card_brand: Option<String>,
    pub card_last_four: Option<String>,
    pub account_last_four: Option<String>,
    pub is_enabled: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait PaymentMethodStore: Send + Sync {
    /// Only returns the instrument when it belongs to `user_id`.
    async fn find_for_user(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<StoredPaymentMethod>, DatabaseError>;

    /// Returns false when no stored instrument matches the processor id.
    async fn set_enabled_by_processor_id(
        &self,
        finix_payment_instrument_id: &str,
        enabled: bool,
    ) -> Result<bool, DatabaseError>;
}

pub struct PgPaymentMethodStore {
    pool: PgPool,
}

impl PgPaymentMethodStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentMethodStore for PgPaymentMethodStore {
    async fn find_for_user(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<StoredPaymentMethod>, DatabaseError> {
        sqlx::query_as::<_, StoredPaymentMethod>(
            "SELECT id, user_id, finix_payment_instrument_id, method_type, card_brand,
                    card_last_four, account_last_four, is_enabled, created_at, updated_at
             FROM user_payment_methods
             WHERE id = $1 AND user_id = $2",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn set_enabled_by_processor_id(
        &self,
        finix_payment_instrument_id: &str,
        enabled: bool,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE user_payment_methods
             SET is_enabled = $2, updated_at = NOW()
             WHERE finix_payment_instrument_id = $1",
        )
        .bind(finix_payment_instrument_id)
        .bind(enabled)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() > 0)
    }
}
