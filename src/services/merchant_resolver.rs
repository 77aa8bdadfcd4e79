use crate::database::error::DatabaseError;
use crate::database::merchant_repository::{Merchant, MerchantStore};
use crate::services::fee_calculation::MerchantFeeSchedule;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Everything the charge path needs to know about the receiving merchant.
#[derive(Debug, Clone, Serialize)]
pub struct MerchantContext {
    pub merchant_id: Uuid,
    pub finix_merchant_id: String,
    pub finix_identity_id: String,
    pub merchant_name: String,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub customer_id: Option<String>,
    pub fee_schedule: MerchantFeeSchedule,
}

#[derive(Debug, Error)]
pub enum MerchantResolutionError {
    #[error("merchant {0} not found")]
    NotFound(Uuid),
    #[error("merchant {merchant_id} is not configured for payments: {reason}")]
    NotConfigured { merchant_id: Uuid, reason: String },
    #[error("merchant lookup failed: {0}")]
    Persistence(#[from] DatabaseError),
}

pub struct MerchantResolver {
    store: Arc<dyn MerchantStore>,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl MerchantResolver {
    pub fn new(store: Arc<dyn MerchantStore>) -> Self {
        Self { store }
    }

    async fn load(&self, merchant_id: Uuid) -> Result<Merchant, MerchantResolutionError> {
        self.store
            .find_by_id(merchant_id)
            .await?
            .ok_or(MerchantResolutionError::NotFound(merchant_id))
    }

    /// Fails with `NotConfigured` until onboarding has produced both processor ids.
    pub async fn resolve_merchant(
        &self,
        merchant_id: Uuid,
    ) -> Result<MerchantContext, MerchantResolutionError> {
        let merchant = self.load(merchant_id).await?;

        let finix_merchant_id = match non_blank(&merchant.finix_merchant_id) {
            Some(id) => id.to_string(),
            None => {
                warn!(merchant_id = %merchant_id, "merchant has no processor merchant id");
                return Err(MerchantResolutionError::NotConfigured {
                    merchant_id,
                    reason: "missing processor merchant id".to_string(),
                });
            }
        };
        let finix_identity_id = match non_blank(&merchant.finix_identity_id) {
            Some(id) => id.to_string(),
            None => {
                warn!(merchant_id = %merchant_id, "merchant has no processor identity id");
                return Err(MerchantResolutionError::NotConfigured {
                    merchant_id,
                    reason: "missing processor identity id".to_string(),
                });
            }
        };

        Ok(MerchantContext {
            merchant_id,
            finix_merchant_id,
            finix_identity_id,
            fee_schedule: MerchantFeeSchedule::from_merchant(&merchant),
            merchant_name: merchant.merchant_name,
            category: merchant.category,
            subcategory: merchant.subcategory,
            customer_id: merchant.customer_id,
        })
    }

    /// Fee schedule only; does not require onboarding to be complete.
    pub async fn fee_schedule(
        &self,
        merchant_id: Uuid,
    ) -> Result<MerchantFeeSchedule, MerchantResolutionError> {
        let merchant = self.load(merchant_id).await?;
        Ok(MerchantFeeSchedule::from_merchant(&merchant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::InMemoryStore;
    use chrono::Utc;

    fn merchant(finix_merchant_id: Option<&str>, finix_identity_id: Option<&str>) -> Merchant {
        Merchant {
            id: Uuid::new_v4(),
            merchant_name: "City of Springfield".to_string(),
            finix_merchant_id: finix_merchant_id.map(str::to_string),
            finix_identity_id: finix_identity_id.map(str::to_string),
            category: Some("permits".to_string()),
            subcategory: None,
            customer_id: Some("cust_1".to_string()),
            basis_points: 290,
            fixed_fee: 30,
            ach_basis_points: 80,
            ach_fixed_fee: 0,
            onboarding_state: Some("APPROVED".to_string()),
            processing_enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn resolves_configured_merchant() {
        let store = Arc::new(InMemoryStore::new());
        let m = merchant(Some("MU123"), Some("ID123"));
        let id = m.id;
        store.insert_merchant(m).await;

        let resolver = MerchantResolver::new(store);
        let ctx = resolver.resolve_merchant(id).await.unwrap();
        assert_eq!(ctx.finix_merchant_id, "MU123");
        assert_eq!(ctx.fee_schedule.card.basis_points, 290);
        assert_eq!(ctx.customer_id.as_deref(), Some("cust_1"));
    }

    #[tokio::test]
    async fn missing_identity_is_not_configured() {
        let store = Arc::new(InMemoryStore::new());
        let m = merchant(Some("MU123"), Some("  "));
        let id = m.id;
        store.insert_merchant(m).await;

        let resolver = MerchantResolver::new(store);
        let err = resolver.resolve_merchant(id).await.unwrap_err();
        assert!(matches!(err, MerchantResolutionError::NotConfigured { .. }));
        // Previews still work before onboarding completes.
        assert!(resolver.fee_schedule(id).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_merchant_is_not_found() {
        let resolver = MerchantResolver::new(Arc::new(InMemoryStore::new()));
        let err = resolver.resolve_merchant(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, MerchantResolutionError::NotFound(_)));
    }
}
