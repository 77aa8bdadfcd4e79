//! Service-fee calculation.
//!
//! The same [`compute_fee`] runs for the client-facing preview and at charge
//! time, so the amount a user is shown is the amount that is charged.

use crate::database::merchant_repository::Merchant;
use crate::services::merchant_resolver::{MerchantResolutionError, MerchantResolver};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

const BASIS_POINT_DIVISOR: i128 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRate {
    pub basis_points: i32,
    pub fixed_fee_cents: i32,
}

/// Card and ACH pricing for one merchant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerchantFeeSchedule {
    pub card: FeeRate,
    pub ach: FeeRate,
}

impl MerchantFeeSchedule {
    pub fn from_merchant(merchant: &Merchant) -> Self {
        Self {
            card: FeeRate {
                basis_points: merchant.basis_points,
                fixed_fee_cents: merchant.fixed_fee,
            },
            ach: FeeRate {
                basis_points: merchant.ach_basis_points,
                fixed_fee_cents: merchant.ach_fixed_fee,
            },
        }
    }

    pub fn rate_for(&self, class: PaymentTypeClass) -> FeeRate {
        match class {
            PaymentTypeClass::Card => self.card,
            PaymentTypeClass::Bank => self.ach,
        }
    }

    /// Audit copy written onto entities, using the merchant table's column names.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "basis_points": self.card.basis_points,
            "fixed_fee": self.card.fixed_fee_cents,
            "ach_basis_points": self.ach.basis_points,
            "ach_fixed_fee": self.ach.fixed_fee_cents,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentTypeClass {
    Card,
    Bank,
}

impl PaymentTypeClass {
    pub fn is_card(&self) -> bool {
        matches!(self, PaymentTypeClass::Card)
    }
}

impl fmt::Display for PaymentTypeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentTypeClass::Card => f.write_str("card"),
            PaymentTypeClass::Bank => f.write_str("bank"),
        }
    }
}

/// Digital wallets settle as card payments; anything that is not card-like
/// is priced as ACH.
pub fn classify_payment_type(payment_type: &str) -> PaymentTypeClass {
    match payment_type.trim() {
        "card" | "PAYMENT_CARD" | "google-pay" | "apple-pay" => PaymentTypeClass::Card,
        _ => PaymentTypeClass::Bank,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeeError {
    #[error("base amount must be greater than zero")]
    NonPositiveAmount,
    #[error("amount of {amount_cents} cents exceeds the per-transaction limit of {limit_cents} cents")]
    AboveLimit { amount_cents: i64, limit_cents: i64 },
    #[error("fee for a base amount of {base_amount_cents} cents is out of range")]
    Overflow { base_amount_cents: i64 },
}

#[derive(Debug, Error)]
pub enum FeePreviewError {
    #[error(transparent)]
    Merchant(#[from] MerchantResolutionError),
    #[error(transparent)]
    Fee(#[from] FeeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeComputation {
    pub base_amount_cents: i64,
    pub fee_cents: i64,
    pub total_cents: i64,
}

/// `fee = round(base * bps / 10000) + fixed`, rounding half away from zero.
pub fn compute_fee(
    base_amount_cents: i64,
    is_card: bool,
    schedule: &MerchantFeeSchedule,
) -> Result<FeeComputation, FeeError> {
    let rate = if is_card { schedule.card } else { schedule.ach };
    let scaled = base_amount_cents as i128 * rate.basis_points as i128;
    let half = BASIS_POINT_DIVISOR / 2;
    let proportional = if scaled >= 0 {
        (scaled + half) / BASIS_POINT_DIVISOR
    } else {
        (scaled - half) / BASIS_POINT_DIVISOR
    };
    let overflow = FeeError::Overflow { base_amount_cents };
    let fee_cents = i64::try_from(proportional + rate.fixed_fee_cents as i128)
        .map_err(|_| overflow.clone())?;
    let total_cents = base_amount_cents.checked_add(fee_cents).ok_or(overflow)?;

    Ok(FeeComputation {
        base_amount_cents,
        fee_cents,
        total_cents,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeePreview {
    pub merchant_id: Uuid,
    pub payment_type: String,
    pub payment_class: PaymentTypeClass,
    pub base_amount_cents: i64,
    pub service_fee_cents: i64,
    pub total_amount_cents: i64,
    pub basis_points: i32,
    pub fixed_fee_cents: i32,
}

/// Preview entry point for the bill-pay UI. Applies the same amount limit
/// as the charge path.
pub struct FeeCalculator {
    merchants: Arc<MerchantResolver>,
    max_transaction_cents: i64,
}

impl FeeCalculator {
    pub fn new(merchants: Arc<MerchantResolver>, max_transaction_cents: i64) -> Self {
        Self {
            merchants,
            max_transaction_cents,
        }
    }

    pub async fn preview(
        &self,
        merchant_id: Uuid,
        base_amount_cents: i64,
        payment_type: &str,
    ) -> Result<FeePreview, FeePreviewError> {
        if base_amount_cents <= 0 {
            return Err(FeeError::NonPositiveAmount.into());
        }
        if base_amount_cents > self.max_transaction_cents {
            return Err(FeeError::AboveLimit {
                amount_cents: base_amount_cents,
                limit_cents: self.max_transaction_cents,
            }
            .into());
        }

        let schedule = self.merchants.fee_schedule(merchant_id).await?;
        let class = classify_payment_type(payment_type);
        let computed = compute_fee(base_amount_cents, class.is_card(), &schedule)?;
        let rate = schedule.rate_for(class);

        debug!(
            merchant_id = %merchant_id,
            base_amount_cents,
            fee_cents = computed.fee_cents,
            class = %class,
            "fee preview computed"
        );

        Ok(FeePreview {
            merchant_id,
            payment_type: payment_type.to_string(),
            payment_class: class,
            base_amount_cents,
            service_fee_cents: computed.fee_cents,
            total_amount_cents: computed.total_cents,
            basis_points: rate.basis_points,
            fixed_fee_cents: rate.fixed_fee_cents,
        })
    }
}
