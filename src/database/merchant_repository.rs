use crate::database::error::DatabaseError;
use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Merchant row with its processor linkage and fee schedule
#[derive(Debug, Clone, FromRow)]
pub struct Merchant {
    pub id: Uuid,
    pub merchant_name: String,
    pub finix_merchant_id: Option<String>,
    pub finix_identity_id: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub customer_id: Option<String>,
    pub basis_points: i32,
    pub fixed_fee: i32,
    pub ach_basis_points: i32,
    pub ach_fixed_fee: i32,
    pub onboarding_state: Option<String>,
    pub processing_enabled: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Processor-reported onboarding changes for a merchant
#[derive(Debug, Clone, Default)]
pub struct MerchantProcessorUpdate {
    pub finix_merchant_id: String,
    pub finix_identity_id: Option<String>,
    pub onboarding_state: Option<String>,
    pub processing_enabled: Option<bool>,
}

#[async_trait]
pub trait MerchantStore: Send + Sync {
    async fn find_by_id(&self, merchant_id: Uuid) -> Result<Option<Merchant>, DatabaseError>;

    async fn apply_processor_update(
        &self,
        update: &MerchantProcessorUpdate,
    ) -> Result<bool, DatabaseError>;

    /// Marks the merchant owning this identity as touched by an identity event.
    async fn touch_identity(&self, finix_identity_id: &str) -> Result<bool, DatabaseError>;
}

pub struct PgMerchantStore {
    pool: PgPool,
}

impl PgMerchantStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MerchantStore for PgMerchantStore {
    async fn find_by_id(&self, merchant_id: Uuid) -> Result<Option<Merchant>, DatabaseError> {
        sqlx::query_as::<_, Merchant>(
            "SELECT id, merchant_name, finix_merchant_id, finix_identity_id, category,
                    subcategory, customer_id, basis_points, fixed_fee, ach_basis_points,
                    ach_fixed_fee, onboarding_state, processing_enabled, created_at, updated_at
             FROM merchants
             WHERE id = $1",
        )
        .bind(merchant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn apply_processor_update(
        &self,
        update: &MerchantProcessorUpdate,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE merchants
             SET onboarding_state = COALESCE($2, onboarding_state),
                 processing_enabled = COALESCE($3, processing_enabled),
                 finix_identity_id = COALESCE(finix_identity_id, $4),
                 updated_at = NOW()
             WHERE finix_merchant_id = $1",
        )
        .bind(&update.finix_merchant_id)
        .bind(&update.onboarding_state)
        .bind(update.processing_enabled)
        .bind(&update.finix_identity_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() > 0)
    }

    async fn touch_identity(&self, finix_identity_id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE merchants
             SET identity_updated_at = NOW(), updated_at = NOW()
             WHERE finix_identity_id = $1",
        )
        .bind(finix_identity_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() > 0)
    }
}
