use axum::{
    body::Bytes,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::services::webhook_processor::{
    WebhookOutcome, WebhookProcessor, WebhookProcessorError,
};

pub const SIGNATURE_HEADER: &str = "finix-signature";

pub struct WebhookState {
    pub processor: Arc<WebhookProcessor>,
}

/// POST /webhooks/finix
pub async fn handle_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    if let Err(e) = state.processor.authenticate(authorization, signature, &body) {
        warn!(error = %e, "Rejected webhook");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    // Parse payload
    let payload: JsonValue = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "Invalid JSON payload");
            if let Err(log_err) = state.processor.record_unparseable(&body, &e.to_string()).await {
                error!(error = %log_err, "Failed to log unparseable webhook");
            }
            return (StatusCode::BAD_REQUEST, "Invalid JSON").into_response();
        }
    };

    match state.processor.process_webhook(&payload).await {
        Ok(WebhookOutcome::Processed) => {
            (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
        }
        Ok(WebhookOutcome::Ignored(reason)) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "ignored", "reason": reason})),
        )
            .into_response(),
        Err(WebhookProcessorError::AlreadyProcessed) => {
            info!("Webhook already processed");
            (
                StatusCode::OK,
                Json(serde_json::json!({"status": "duplicate"})),
            )
                .into_response()
        }
        Err(WebhookProcessorError::InvalidPayload(message)) => {
            warn!(error = %message, "Malformed webhook event");
            (StatusCode::BAD_REQUEST, "Invalid event").into_response()
        }
        Err(e) => {
            // Non-2xx so the processor redelivers
            error!(error = %e, "Webhook processing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"status": "error"})),
            )
                .into_response()
        }
    }
}
