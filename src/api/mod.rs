//! HTTP surface: payment endpoints and the processor webhook

pub mod payments;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub use payments::PaymentsState;
pub use webhooks::WebhookState;

pub fn payment_routes(state: PaymentsState) -> Router {
    Router::new()
        .route("/api/payments", post(payments::create_payment))
        .route(
            "/api/payments/google-pay",
            post(payments::create_google_pay_payment),
        )
        .route(
            "/api/payments/apple-pay",
            post(payments::create_apple_pay_payment),
        )
        .route("/api/payments/token", post(payments::create_token_payment))
        .route("/api/payments/fee-preview", get(payments::fee_preview))
        .route(
            "/api/payments/transactions/{id}",
            get(payments::get_transaction),
        )
        .route(
            "/api/payments/transactions/{id}/refund",
            post(payments::refund_transaction),
        )
        .with_state(state)
}

pub fn webhook_routes(state: WebhookState) -> Router {
    Router::new()
        .route("/webhooks/finix", post(webhooks::handle_webhook))
        .with_state(Arc::new(state))
}
