//! FinixGateway against a local HTTP stub, driven through the orchestrator.

mod common;

use axum::{http::StatusCode, routing::post, Router};
use chrono::Utc;
use common::{transfer_event, Harness};
use municipal_payments::config::FinixConfig;
use municipal_payments::database::entity_repository::EntityType;
use municipal_payments::database::transaction_repository::PaymentStatus;
use municipal_payments::payments::providers::FinixGateway;
use municipal_payments::payments::types::TransferState;
use serde_json::json;
use std::sync::Arc;

/// Serves `status` and `body` for every POST /transfers.
async fn stub_processor(status: StatusCode, body: &'static str) -> String {
    let app = Router::new().route("/transfers", post(move || async move { (status, body) }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn harness(status: StatusCode, body: &'static str) -> Harness {
    let base_url = stub_processor(status, body).await;
    let gateway = FinixGateway::new(&FinixConfig {
        base_url,
        username: "USsandbox".to_string(),
        password: "secret".to_string(),
        api_version: "2022-02-01".to_string(),
        timeout_secs: 5,
    })
    .unwrap();
    Harness::with_gateway(Arc::new(gateway)).await
}

#[tokio::test]
async fn test_succeeded_transfer_is_paid() {
    let h = harness(
        StatusCode::CREATED,
        r#"{"id":"TRok","amount":10320,"state":"SUCCEEDED"}"#,
    )
    .await;
    let request = h.request(EntityType::Permit, "approved").await;

    let result = h.orchestrator.process_payment(request).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.processor_transfer_id.as_deref(), Some("TRok"));
    let rows = h.store.transactions().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].payment_status, PaymentStatus::Paid);
}

#[tokio::test]
async fn test_accepted_transfer_with_unreadable_body_keeps_row() {
    let h = harness(StatusCode::CREATED, r#"{"id":"TRreal","amount":10320}"#).await;
    let request = h.request(EntityType::Permit, "approved").await;

    let result = h.orchestrator.process_payment(request).await;

    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("PAYMENT_OUTCOME_UNKNOWN"));
    assert!(!result.retryable);
    assert_eq!(result.status, Some(TransferState::Pending));
    assert_eq!(result.processor_transfer_id.as_deref(), Some("TRreal"));

    let rows = h.store.transactions().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].payment_status, PaymentStatus::Unpaid);
    assert_eq!(rows[0].finix_transfer_id.as_deref(), Some("TRreal"));

    // The recorded transfer id is enough for the webhook to settle the row.
    let event = transfer_event("EVstub1", "TRreal", "SUCCEEDED", Utc::now(), json!({}), None);
    h.webhooks.process_webhook(&event).await.unwrap();
    let tx = h.ledger.find_by_id(rows[0].id).await.unwrap().unwrap();
    assert_eq!(tx.payment_status, PaymentStatus::Paid);
}

#[tokio::test]
async fn test_non_json_success_body_keeps_row() {
    let h = harness(StatusCode::OK, "<html>ok</html>").await;
    let request = h.request(EntityType::Permit, "approved").await;

    let result = h.orchestrator.process_payment(request).await;

    assert_eq!(result.error_code.as_deref(), Some("PAYMENT_OUTCOME_UNKNOWN"));
    assert!(!result.retryable);
    let rows = h.store.transactions().await;
    assert_eq!(rows.len(), 1);
    assert!(rows[0].finix_transfer_id.is_none());
}

#[tokio::test]
async fn test_gateway_errors_leave_outcome_open() {
    for status in [
        StatusCode::INTERNAL_SERVER_ERROR,
        StatusCode::BAD_GATEWAY,
        StatusCode::GATEWAY_TIMEOUT,
    ] {
        let h = harness(status, "upstream error").await;
        let request = h.request(EntityType::Permit, "approved").await;

        let result = h.orchestrator.process_payment(request).await;

        assert!(!result.success, "{}", status);
        assert_eq!(
            result.error_code.as_deref(),
            Some("PAYMENT_OUTCOME_UNKNOWN"),
            "{}",
            status
        );
        assert!(!result.retryable, "{}", status);
        let rows = h.store.transactions().await;
        assert_eq!(rows.len(), 1, "{}", status);
        assert_eq!(rows[0].payment_status, PaymentStatus::Unpaid);
    }
}

#[tokio::test]
async fn test_service_unavailable_rolls_back_and_is_retryable() {
    let h = harness(StatusCode::SERVICE_UNAVAILABLE, "").await;
    let request = h.request(EntityType::Permit, "approved").await;

    let result = h.orchestrator.process_payment(request).await;

    assert_eq!(result.error_code.as_deref(), Some("PAYMENT_PROCESSOR_ERROR"));
    assert!(result.retryable);
    assert!(h.store.transactions().await.is_empty());
}

#[tokio::test]
async fn test_decline_rolls_back() {
    let h = harness(
        StatusCode::PAYMENT_REQUIRED,
        r#"{"_embedded":{"errors":[{"code":"DECLINED","failure_code":"CARD_DECLINED","message":"Card declined"}]}}"#,
    )
    .await;
    let request = h.request(EntityType::Permit, "approved").await;

    let result = h.orchestrator.process_payment(request).await;

    assert_eq!(result.error_code.as_deref(), Some("PAYMENT_DECLINED"));
    assert!(!result.retryable);
    assert!(h.store.transactions().await.is_empty());
}
