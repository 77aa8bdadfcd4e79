mod common;

use municipal_payments::database::memory::InMemoryStore;
use municipal_payments::services::fee_calculation::{
    FeeCalculator, FeeError, FeePreviewError, PaymentTypeClass,
};
use municipal_payments::services::merchant_resolver::{MerchantResolutionError, MerchantResolver};
use std::sync::Arc;
use uuid::Uuid;

async fn calculator() -> (FeeCalculator, Arc<InMemoryStore>, Uuid) {
    let store = Arc::new(InMemoryStore::new());
    let merchant_id = Uuid::new_v4();
    store.insert_merchant(common::merchant(merchant_id)).await;
    let resolver = Arc::new(MerchantResolver::new(store.clone()));
    (FeeCalculator::new(resolver, 10_000_000), store, merchant_id)
}

#[tokio::test]
async fn test_card_preview() {
    let (calc, _, merchant_id) = calculator().await;

    let preview = calc.preview(merchant_id, 10_000, "card").await.unwrap();

    assert_eq!(preview.payment_class, PaymentTypeClass::Card);
    assert_eq!(preview.service_fee_cents, 320);
    assert_eq!(preview.total_amount_cents, 10_320);
    assert_eq!(preview.basis_points, 290);
    assert_eq!(preview.fixed_fee_cents, 30);
}

#[tokio::test]
async fn test_processor_card_types_use_card_schedule() {
    let (calc, _, merchant_id) = calculator().await;

    for payment_type in ["PAYMENT_CARD", "google-pay", "apple-pay"] {
        let preview = calc.preview(merchant_id, 2_500, payment_type).await.unwrap();
        // 2500 * 2.9% = 72.5, rounds up to 73
        assert_eq!(preview.service_fee_cents, 103, "{}", payment_type);
    }
}

#[tokio::test]
async fn test_everything_else_is_bank() {
    let (calc, _, merchant_id) = calculator().await;

    for payment_type in ["bank_account", "BANK_ACCOUNT", "ach"] {
        let preview = calc.preview(merchant_id, 12_345, payment_type).await.unwrap();
        assert_eq!(preview.payment_class, PaymentTypeClass::Bank);
        // 12345 * 0.8% = 98.76
        assert_eq!(preview.service_fee_cents, 99);
        assert_eq!(preview.total_amount_cents, 12_444);
    }
}

#[tokio::test]
async fn test_preview_does_not_require_onboarding() {
    let (calc, store, _) = calculator().await;
    let merchant_id = Uuid::new_v4();
    let mut merchant = common::merchant(merchant_id);
    merchant.finix_merchant_id = None;
    merchant.finix_identity_id = None;
    store.insert_merchant(merchant).await;

    let preview = calc.preview(merchant_id, 1_000, "card").await.unwrap();

    assert_eq!(preview.service_fee_cents, 59);
}

#[tokio::test]
async fn test_unknown_merchant() {
    let (calc, _, _) = calculator().await;
    let missing = Uuid::new_v4();

    let err = calc.preview(missing, 1_000, "card").await.unwrap_err();

    assert!(matches!(
        err,
        FeePreviewError::Merchant(MerchantResolutionError::NotFound(id)) if id == missing
    ));
}

#[tokio::test]
async fn test_amount_above_limit_is_rejected() {
    let (calc, _, merchant_id) = calculator().await;

    let err = calc
        .preview(merchant_id, i64::MAX - 10, "card")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        FeePreviewError::Fee(FeeError::AboveLimit {
            limit_cents: 10_000_000,
            ..
        })
    ));
}

#[tokio::test]
async fn test_non_positive_amount_is_rejected_before_lookup() {
    let (calc, _, _) = calculator().await;

    let err = calc.preview(Uuid::new_v4(), 0, "card").await.unwrap_err();

    assert!(matches!(err, FeePreviewError::Fee(FeeError::NonPositiveAmount)));
}
