//! Payment side effects on the entity being paid for.
//!
//! Shared by the synchronous charge path and the webhook reconciler, since
//! either may observe a successful transfer first. Every write is
//! conditional, so running fulfillment twice leaves the entity unchanged.

use crate::database::entity_repository::{
    EntityPaymentUpdate, EntityRef, EntityStore, EntityType, ServiceTileFlags,
};
use crate::database::error::DatabaseError;
use crate::database::merchant_repository::MerchantStore;
use crate::database::transaction_repository::PaymentTransaction;
use crate::services::fee_calculation::MerchantFeeSchedule;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const STATUS_APPROVED: &str = "approved";
pub const STATUS_ISSUED: &str = "issued";
pub const STATUS_RESERVED: &str = "reserved";

/// A conditional status transition to attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoIssueDecision {
    pub expected_status: String,
    pub target_status: &'static str,
    pub stamp_issued_at: bool,
}

impl AutoIssueDecision {
    fn new(expected: &str, target: &'static str, stamp_issued_at: bool) -> Self {
        Self {
            expected_status: expected.to_string(),
            target_status: target,
            stamp_issued_at,
        }
    }
}

/// Decides whether a freshly paid entity may advance without manual action.
///
/// Tax submissions never auto-advance. Service applications need their tile
/// flags; without them nothing is decided.
pub fn decide_auto_issue(
    entity_type: EntityType,
    current_status: &str,
    tile_flags: Option<ServiceTileFlags>,
) -> Option<AutoIssueDecision> {
    match entity_type {
        EntityType::Permit if current_status == STATUS_APPROVED => Some(AutoIssueDecision::new(
            current_status,
            STATUS_ISSUED,
            false,
        )),
        EntityType::BusinessLicense if current_status == STATUS_APPROVED => Some(
            AutoIssueDecision::new(current_status, STATUS_ISSUED, true),
        ),
        EntityType::ServiceApplication => {
            let flags = tile_flags?;
            if current_status == STATUS_ISSUED || current_status == STATUS_RESERVED {
                return None;
            }
            if flags.requires_review && current_status != STATUS_APPROVED {
                return None;
            }
            if flags.has_time_slots {
                Some(AutoIssueDecision::new(current_status, STATUS_RESERVED, false))
            } else {
                Some(AutoIssueDecision::new(current_status, STATUS_ISSUED, true))
            }
        }
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AutoIssueOutcome {
    Advanced { from: String, to: String },
    NotEligible { status: Option<String> },
    /// Status changed between the read and the conditional write
    Raced,
}

/// Result of the best-effort fulfillment step.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FulfillmentReport {
    pub entity_recorded: bool,
    pub auto_issue: Option<AutoIssueOutcome>,
    pub warnings: Vec<String>,
}

pub struct EntityStatusUpdater {
    entities: Arc<dyn EntityStore>,
    merchants: Arc<dyn MerchantStore>,
}

impl EntityStatusUpdater {
    pub fn new(entities: Arc<dyn EntityStore>, merchants: Arc<dyn MerchantStore>) -> Self {
        Self {
            entities,
            merchants,
        }
    }

    /// Writes the paid outcome onto the entity row. Returns false when the
    /// entity was already paid or does not exist.
    pub async fn update_entity_status(
        &self,
        update: &EntityPaymentUpdate,
    ) -> Result<bool, DatabaseError> {
        let written = self.entities.record_payment(update).await?;
        if written {
            info!(
                entity_type = %update.entity.entity_type,
                entity_id = %update.entity.entity_id,
                transaction_id = %update.transaction_id,
                "entity marked paid"
            );
        }
        Ok(written)
    }

    pub async fn auto_issue_entity(
        &self,
        entity: EntityRef,
    ) -> Result<AutoIssueOutcome, DatabaseError> {
        let Some(current) = self.entities.current_status(entity).await? else {
            return Ok(AutoIssueOutcome::NotEligible { status: None });
        };

        let flags = match entity.entity_type {
            EntityType::ServiceApplication => {
                let flags = self.entities.service_tile_flags(entity.entity_id).await?;
                if flags.is_none() {
                    warn!(
                        entity_id = %entity.entity_id,
                        "service application has no tile flags, skipping auto-issue"
                    );
                }
                flags
            }
            _ => None,
        };

        let Some(decision) = decide_auto_issue(entity.entity_type, &current, flags) else {
            return Ok(AutoIssueOutcome::NotEligible {
                status: Some(current),
            });
        };

        let advanced = self
            .entities
            .advance_status(
                entity,
                &decision.expected_status,
                decision.target_status,
                decision.stamp_issued_at,
            )
            .await?;

        if !advanced {
            return Ok(AutoIssueOutcome::Raced);
        }

        info!(
            entity_type = %entity.entity_type,
            entity_id = %entity.entity_id,
            from = %decision.expected_status,
            to = decision.target_status,
            "entity auto-issued"
        );
        Ok(AutoIssueOutcome::Advanced {
            from: decision.expected_status,
            to: decision.target_status.to_string(),
        })
    }

    /// Applies both steps for a paid transaction. Never fails: problems are
    /// logged and returned as warnings because the charge already happened.
    pub async fn fulfill(&self, tx: &PaymentTransaction) -> FulfillmentReport {
        let mut report = FulfillmentReport::default();
        let entity = EntityRef {
            entity_type: tx.entity_type,
            entity_id: tx.entity_id,
        };

        let fee_snapshot = if tx.entity_type.records_fee_snapshot() {
            match self.merchants.find_by_id(tx.merchant_id).await {
                Ok(Some(merchant)) => Some(MerchantFeeSchedule::from_merchant(&merchant).snapshot()),
                Ok(None) => None,
                Err(err) => {
                    warn!(merchant_id = %tx.merchant_id, error = %err, "fee snapshot unavailable");
                    None
                }
            }
        } else {
            None
        };

        let update = EntityPaymentUpdate {
            entity,
            transaction_id: tx.id,
            total_amount_cents: tx.total_amount_cents,
            service_fee_cents: tx.service_fee_cents,
            finix_transfer_id: tx.finix_transfer_id.clone(),
            finix_payment_instrument_id: tx.finix_payment_instrument_id.clone(),
            fee_snapshot,
            processed_at: tx.paid_at.unwrap_or_else(Utc::now),
        };

        match self.update_entity_status(&update).await {
            Ok(written) => report.entity_recorded = written,
            Err(err) => {
                error!(
                    transaction_id = %tx.id,
                    entity_id = %tx.entity_id,
                    error = %err,
                    "failed to record payment on entity"
                );
                report
                    .warnings
                    .push(format!("entity update failed: {}", err));
            }
        }

        match self.auto_issue_entity(entity).await {
            Ok(outcome) => report.auto_issue = Some(outcome),
            Err(err) => {
                error!(
                    transaction_id = %tx.id,
                    entity_id = %tx.entity_id,
                    error = %err,
                    "auto-issue failed"
                );
                report.warnings.push(format!("auto-issue failed: {}", err));
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(requires_review: bool, has_time_slots: bool) -> Option<ServiceTileFlags> {
        Some(ServiceTileFlags {
            requires_review,
            has_time_slots,
        })
    }

    #[test]
    fn permits_and_licenses_issue_only_from_approved() {
        let permit = decide_auto_issue(EntityType::Permit, "approved", None).unwrap();
        assert_eq!(permit.target_status, STATUS_ISSUED);
        assert!(!permit.stamp_issued_at);
        assert!(decide_auto_issue(EntityType::Permit, "submitted", None).is_none());

        let license = decide_auto_issue(EntityType::BusinessLicense, "approved", None).unwrap();
        assert!(license.stamp_issued_at);
        assert!(decide_auto_issue(EntityType::BusinessLicense, "under_review", None).is_none());
    }

    #[test]
    fn reviewed_service_waits_for_approval() {
        assert!(
            decide_auto_issue(EntityType::ServiceApplication, "submitted", flags(true, false))
                .is_none()
        );
        let issued =
            decide_auto_issue(EntityType::ServiceApplication, "approved", flags(true, false))
                .unwrap();
        assert_eq!(issued.target_status, STATUS_ISSUED);
        assert!(issued.stamp_issued_at);

        let reserved =
            decide_auto_issue(EntityType::ServiceApplication, "approved", flags(true, true))
                .unwrap();
        assert_eq!(reserved.target_status, STATUS_RESERVED);
        assert!(!reserved.stamp_issued_at);
    }

    #[test]
    fn unreviewed_service_advances_from_any_open_status() {
        let decision =
            decide_auto_issue(EntityType::ServiceApplication, "draft", flags(false, true))
                .unwrap();
        assert_eq!(decision.expected_status, "draft");
        assert_eq!(decision.target_status, STATUS_RESERVED);
        assert!(
            decide_auto_issue(EntityType::ServiceApplication, "issued", flags(false, false))
                .is_none()
        );
        assert!(decide_auto_issue(EntityType::ServiceApplication, "draft", None).is_none());
    }

    #[test]
    fn tax_submissions_never_auto_advance() {
        assert!(decide_auto_issue(EntityType::TaxSubmission, "approved", None).is_none());
    }
}
