mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{transfer_event, Harness, TransferBehavior};
use municipal_payments::database::entity_repository::{EntityRef, EntityType};
use municipal_payments::database::payment_method_repository::StoredPaymentMethod;
use municipal_payments::database::transaction_repository::PaymentStatus;
use municipal_payments::database::webhook_repository::WebhookEventStatus;
use municipal_payments::payments::types::TransferState;
use municipal_payments::services::{WebhookOutcome, WebhookProcessorError};
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

/// Charges a permit with a PENDING transfer and returns the harness, the
/// transaction id, the transfer id and the permit id.
async fn pending_payment() -> (Harness, Uuid, String, Uuid) {
    let h = Harness::new(TransferBehavior::Pending).await;
    let request = h.request(EntityType::Permit, "approved").await;
    let entity_id = request.entity_id;
    let result = h.orchestrator.process_payment(request).await;
    assert!(result.success);
    (
        h,
        result.transaction_id.unwrap(),
        result.processor_transfer_id.unwrap(),
        entity_id,
    )
}

fn permit(entity_id: Uuid) -> EntityRef {
    EntityRef {
        entity_type: EntityType::Permit,
        entity_id,
    }
}

#[tokio::test]
async fn test_succeeded_event_marks_paid_and_fulfills() {
    let (h, transaction_id, transfer_id, entity_id) = pending_payment().await;

    let outcome = h
        .webhooks
        .process_webhook(&transfer_event(
            "EV1",
            &transfer_id,
            "SUCCEEDED",
            Utc::now(),
            json!({}),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(outcome, WebhookOutcome::Processed);
    let tx = h.ledger.find_by_id(transaction_id).await.unwrap().unwrap();
    assert_eq!(tx.payment_status, PaymentStatus::Paid);
    assert_eq!(tx.transfer_state, TransferState::Succeeded);
    assert_eq!(tx.last_webhook_event_id.as_deref(), Some("EV1"));

    let row = h.store.entity(permit(entity_id)).await.unwrap();
    assert_eq!(row.payment_status, "paid");
    assert_eq!(row.status, "issued");
    assert_eq!(row.payment_writes, 1);

    let events = h.store.webhook_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, WebhookEventStatus::Processed);
}

#[tokio::test]
async fn test_redelivered_event_is_reported_as_duplicate() {
    let (h, _, transfer_id, _) = pending_payment().await;
    let event = transfer_event("EV2", &transfer_id, "SUCCEEDED", Utc::now(), json!({}), None);

    h.webhooks.process_webhook(&event).await.unwrap();
    let second = h.webhooks.process_webhook(&event).await;

    assert!(matches!(second, Err(WebhookProcessorError::AlreadyProcessed)));
    let events = h.store.webhook_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].delivery_count, 2);
}

#[tokio::test]
async fn test_new_event_for_paid_transfer_does_not_fulfill_twice() {
    let (h, _, transfer_id, entity_id) = pending_payment().await;

    h.webhooks
        .process_webhook(&transfer_event(
            "EV3a",
            &transfer_id,
            "SUCCEEDED",
            Utc::now(),
            json!({}),
            None,
        ))
        .await
        .unwrap();
    let outcome = h
        .webhooks
        .process_webhook(&transfer_event(
            "EV3b",
            &transfer_id,
            "SUCCEEDED",
            Utc::now(),
            json!({}),
            None,
        ))
        .await
        .unwrap();

    assert!(matches!(outcome, WebhookOutcome::Ignored(_)));
    let row = h.store.entity(permit(entity_id)).await.unwrap();
    assert_eq!(row.payment_writes, 1);
}

#[tokio::test]
async fn test_failed_event_never_downgrades_paid_row() {
    let (h, transaction_id, transfer_id, entity_id) = pending_payment().await;
    let now = Utc::now();

    h.webhooks
        .process_webhook(&transfer_event("EV4a", &transfer_id, "SUCCEEDED", now, json!({}), None))
        .await
        .unwrap();
    let outcome = h
        .webhooks
        .process_webhook(&transfer_event(
            "EV4b",
            &transfer_id,
            "FAILED",
            now + ChronoDuration::seconds(5),
            json!({}),
            None,
        ))
        .await
        .unwrap();

    assert!(matches!(outcome, WebhookOutcome::Ignored(_)));
    let tx = h.ledger.find_by_id(transaction_id).await.unwrap().unwrap();
    assert_eq!(tx.payment_status, PaymentStatus::Paid);
    let row = h.store.entity(permit(entity_id)).await.unwrap();
    assert_eq!(row.payment_status, "paid");
}

#[tokio::test]
async fn test_failed_event_marks_pending_row_failed() {
    let (h, transaction_id, transfer_id, entity_id) = pending_payment().await;

    let mut event = transfer_event("EV5", &transfer_id, "FAILED", Utc::now(), json!({}), None);
    event["_embedded"]["transfers"][0]["failure_code"] = json!("INSUFFICIENT_FUNDS");
    h.webhooks.process_webhook(&event).await.unwrap();

    let tx = h.ledger.find_by_id(transaction_id).await.unwrap().unwrap();
    assert_eq!(tx.payment_status, PaymentStatus::Failed);
    assert_eq!(tx.failure_reason.as_deref(), Some("INSUFFICIENT_FUNDS"));
    let row = h.store.entity(permit(entity_id)).await.unwrap();
    assert_eq!(row.payment_status, "unpaid");
    assert_eq!(row.status, "approved");
}

#[tokio::test]
async fn test_out_of_order_events_are_skipped() {
    let h = Harness::with_timeout(TransferBehavior::Hang, Duration::from_millis(50)).await;
    let request = h.request(EntityType::Permit, "approved").await;
    let result = h.orchestrator.process_payment(request).await;
    let transaction_id = result.transaction_id.unwrap();
    let tags = json!({"transaction_id": transaction_id.to_string()});
    let observed = Utc::now();

    let linked = h
        .webhooks
        .process_webhook(&transfer_event("EV6a", "TRslow", "PENDING", observed, tags.clone(), None))
        .await
        .unwrap();
    assert_eq!(linked, WebhookOutcome::Processed);

    let stale = h
        .webhooks
        .process_webhook(&transfer_event(
            "EV6b",
            "TRslow",
            "SUCCEEDED",
            observed - ChronoDuration::minutes(10),
            tags.clone(),
            None,
        ))
        .await
        .unwrap();
    assert!(matches!(stale, WebhookOutcome::Ignored(_)));
    let tx = h.ledger.find_by_id(transaction_id).await.unwrap().unwrap();
    assert_eq!(tx.payment_status, PaymentStatus::Unpaid);
    assert_eq!(tx.finix_transfer_id.as_deref(), Some("TRslow"));

    h.webhooks
        .process_webhook(&transfer_event(
            "EV6c",
            "TRslow",
            "SUCCEEDED",
            observed + ChronoDuration::minutes(1),
            tags,
            None,
        ))
        .await
        .unwrap();
    let tx = h.ledger.find_by_id(transaction_id).await.unwrap().unwrap();
    assert_eq!(tx.payment_status, PaymentStatus::Paid);
}

#[tokio::test]
async fn test_transfer_found_by_idempotency_id() {
    let h = Harness::with_timeout(TransferBehavior::Hang, Duration::from_millis(50)).await;
    let request = h.request(EntityType::Permit, "approved").await;
    let result = h.orchestrator.process_payment(request).await;
    let transaction_id = result.transaction_id.unwrap();
    let key = h.gateway.last_transfer().operation_key;

    let outcome = h
        .webhooks
        .process_webhook(&transfer_event(
            "EV7",
            "TRbykey",
            "SUCCEEDED",
            Utc::now(),
            json!({}),
            Some(key.as_str()),
        ))
        .await
        .unwrap();

    assert_eq!(outcome, WebhookOutcome::Processed);
    let tx = h.ledger.find_by_id(transaction_id).await.unwrap().unwrap();
    assert_eq!(tx.payment_status, PaymentStatus::Paid);
    assert_eq!(tx.finix_transfer_id.as_deref(), Some("TRbykey"));
}

#[tokio::test]
async fn test_tag_fallback_ignores_rows_linked_to_another_transfer() {
    let (h, transaction_id, _, _) = pending_payment().await;

    let outcome = h
        .webhooks
        .process_webhook(&transfer_event(
            "EV8",
            "TRother",
            "SUCCEEDED",
            Utc::now(),
            json!({"transaction_id": transaction_id.to_string()}),
            None,
        ))
        .await
        .unwrap();

    assert!(matches!(outcome, WebhookOutcome::Ignored(_)));
    let tx = h.ledger.find_by_id(transaction_id).await.unwrap().unwrap();
    assert_eq!(tx.payment_status, PaymentStatus::Unpaid);
}

#[tokio::test]
async fn test_unknown_transfer_is_ignored() {
    let h = Harness::new(TransferBehavior::Succeed).await;

    let outcome = h
        .webhooks
        .process_webhook(&transfer_event("EV9", "TRnobody", "SUCCEEDED", Utc::now(), json!({}), None))
        .await
        .unwrap();

    assert!(matches!(outcome, WebhookOutcome::Ignored(_)));
    assert_eq!(
        h.store.webhook_events().await[0].status,
        WebhookEventStatus::Processed
    );
}

#[tokio::test]
async fn test_merchant_onboarding_update() {
    let h = Harness::new(TransferBehavior::Succeed).await;

    let outcome = h
        .webhooks
        .process_webhook(&json!({
            "id": "EVm1",
            "type": "updated",
            "entity": "merchant",
            "_embedded": {"merchants": [{
                "id": common::FINIX_MERCHANT_ID,
                "onboarding_state": "REJECTED",
                "processing_enabled": false
            }]}
        }))
        .await
        .unwrap();

    assert_eq!(outcome, WebhookOutcome::Processed);
    let merchant = h.store.merchant(h.merchant_id).await.unwrap();
    assert_eq!(merchant.onboarding_state.as_deref(), Some("REJECTED"));
    assert!(!merchant.processing_enabled);
}

#[tokio::test]
async fn test_instrument_disabled_by_processor() {
    let h = Harness::new(TransferBehavior::Succeed).await;
    let now = Utc::now();
    let method = StoredPaymentMethod {
        id: Uuid::new_v4(),
        user_id: h.user_id,
        finix_payment_instrument_id: "PIexpired".to_string(),
        method_type: "card".to_string(),
        card_brand: Some("VISA".to_string()),
        card_last_four: Some("1111".to_string()),
        account_last_four: None,
        is_enabled: true,
        created_at: now,
        updated_at: now,
    };
    h.store.insert_payment_method(method.clone()).await;

    let outcome = h
        .webhooks
        .process_webhook(&json!({
            "id": "EVpi1",
            "type": "updated",
            "entity": "payment_instrument",
            "_embedded": {"payment_instruments": [{"id": "PIexpired", "enabled": false}]}
        }))
        .await
        .unwrap();

    assert_eq!(outcome, WebhookOutcome::Processed);
    assert!(!h.store.payment_method(method.id).await.unwrap().is_enabled);
}

#[tokio::test]
async fn test_dispute_is_recorded_against_transaction() {
    let h = Harness::new(TransferBehavior::Succeed).await;
    let request = h.request(EntityType::Permit, "approved").await;
    let result = h.orchestrator.process_payment(request).await;
    let transfer_id = result.processor_transfer_id.unwrap();

    h.webhooks
        .process_webhook(&json!({
            "id": "EVdp1",
            "type": "created",
            "entity": "dispute",
            "_embedded": {"disputes": [{
                "id": "DPone",
                "transfer": transfer_id,
                "state": "PENDING",
                "reason": "FRAUD",
                "amount": 10_320
            }]}
        }))
        .await
        .unwrap();

    let dispute = h.store.dispute("DPone").await.unwrap();
    assert_eq!(dispute.transaction_id, result.transaction_id);
    assert_eq!(dispute.state.as_deref(), Some("PENDING"));
    assert_eq!(dispute.amount_cents, Some(10_320));
}

#[tokio::test]
async fn test_unhandled_entity_is_ignored() {
    let h = Harness::new(TransferBehavior::Succeed).await;

    let outcome = h
        .webhooks
        .process_webhook(&json!({"id": "EVx", "type": "created", "entity": "settlement"}))
        .await
        .unwrap();

    assert!(matches!(outcome, WebhookOutcome::Ignored(_)));
}

#[tokio::test]
async fn test_retry_gives_up_after_max_retries() {
    let h = Harness::new(TransferBehavior::Succeed).await;
    let broken = json!({
        "id": "EVbroken",
        "type": "updated",
        "entity": "transfer",
        "_embedded": {"transfers": "not-a-list"}
    });

    let first = h.webhooks.process_webhook(&broken).await;
    assert!(matches!(first, Err(WebhookProcessorError::InvalidPayload(_))));

    // Harness allows five attempts in total
    for _ in 0..4 {
        assert_eq!(h.webhooks.retry_pending().await.unwrap(), 0);
    }
    let events = h.store.webhook_events().await;
    assert_eq!(events[0].status, WebhookEventStatus::Failed);
    assert_eq!(events[0].retry_count, 5);
    assert!(events[0].last_error.is_some());

    assert_eq!(h.webhooks.retry_pending().await.unwrap(), 0);
    assert_eq!(h.store.webhook_events().await[0].retry_count, 5);
}
