//! /api/payments endpoints: charges, fee preview, refunds and lookup

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::database::entity_repository::EntityType;
use crate::database::transaction_repository::{PaymentStatus, PaymentTransaction};
use crate::error::AppError;
use crate::payments::types::TransferState;
use crate::services::fee_calculation::FeeCalculator;
use crate::services::payment_orchestrator::{
    NewInstrumentPaymentRequest, OrchestratorError, PaymentOrchestrator, PaymentResult,
    ProcessPaymentRequest,
};

#[derive(Clone)]
pub struct PaymentsState {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub fee_calculator: Arc<FeeCalculator>,
}

#[derive(Debug, Deserialize)]
pub struct FeePreviewQuery {
    pub merchant_id: Uuid,
    pub base_amount_cents: i64,
    #[serde(default = "default_preview_type")]
    pub payment_type: String,
}

fn default_preview_type() -> String {
    "card".to_string()
}

#[derive(Debug, Default, Deserialize)]
pub struct RefundRequest {
    #[serde(default)]
    pub amount_cents: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Ledger fields safe to return to the bill-pay UI.
#[derive(Debug, Serialize)]
pub struct TransactionView {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub merchant_id: Uuid,
    pub base_amount_cents: i64,
    pub service_fee_cents: i64,
    pub total_amount_cents: i64,
    pub refunded_amount_cents: i64,
    pub currency: String,
    pub payment_type: String,
    pub card_brand: Option<String>,
    pub card_last_four: Option<String>,
    pub bank_last_four: Option<String>,
    pub payment_status: PaymentStatus,
    pub transfer_state: TransferState,
    pub finix_transfer_id: Option<String>,
    pub failure_reason: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<PaymentTransaction> for TransactionView {
    fn from(tx: PaymentTransaction) -> Self {
        Self {
            id: tx.id,
            entity_type: tx.entity_type,
            entity_id: tx.entity_id,
            merchant_id: tx.merchant_id,
            base_amount_cents: tx.base_amount_cents,
            service_fee_cents: tx.service_fee_cents,
            total_amount_cents: tx.total_amount_cents,
            refunded_amount_cents: tx.refunded_amount_cents,
            currency: tx.currency,
            payment_type: tx.payment_type,
            card_brand: tx.card_brand,
            card_last_four: tx.card_last_four,
            bank_last_four: tx.bank_last_four,
            payment_status: tx.payment_status,
            transfer_state: tx.transfer_state,
            finix_transfer_id: tx.finix_transfer_id,
            failure_reason: tx.failure_reason,
            paid_at: tx.paid_at,
            created_at: tx.created_at,
        }
    }
}

/// HTTP status for a charge outcome. The body is always the full
/// `PaymentResult` so the UI can read `retryable` and `error_code`.
fn payment_status_code(result: &PaymentResult) -> StatusCode {
    if result.success {
        return match result.status {
            Some(TransferState::Pending) => StatusCode::ACCEPTED,
            _ => StatusCode::OK,
        };
    }
    match result.error_code.as_deref() {
        Some("VALIDATION_ERROR") => StatusCode::BAD_REQUEST,
        Some("DUPLICATE_IN_FLIGHT") => StatusCode::CONFLICT,
        Some("PAYMENT_DECLINED") => StatusCode::PAYMENT_REQUIRED,
        Some("MERCHANT_NOT_FOUND") | Some("PAYMENT_INSTRUMENT_NOT_FOUND") => {
            StatusCode::NOT_FOUND
        }
        Some("MERCHANT_NOT_CONFIGURED") => StatusCode::UNPROCESSABLE_ENTITY,
        Some("PAYMENT_OUTCOME_UNKNOWN") => StatusCode::ACCEPTED,
        Some("PAYMENT_PROCESSOR_ERROR") => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn payment_response(result: PaymentResult) -> Response {
    (payment_status_code(&result), Json(result)).into_response()
}

/// POST /api/payments
pub async fn create_payment(
    State(state): State<PaymentsState>,
    Json(request): Json<ProcessPaymentRequest>,
) -> Response {
    info!(
        entity_type = %request.entity_type,
        entity_id = %request.entity_id,
        merchant_id = %request.merchant_id,
        "Payment request received"
    );
    payment_response(state.orchestrator.process_instrument_payment(request).await)
}

/// POST /api/payments/google-pay
pub async fn create_google_pay_payment(
    State(state): State<PaymentsState>,
    Json(request): Json<NewInstrumentPaymentRequest>,
) -> Response {
    payment_response(state.orchestrator.process_google_pay_payment(request).await)
}

/// POST /api/payments/apple-pay
pub async fn create_apple_pay_payment(
    State(state): State<PaymentsState>,
    Json(request): Json<NewInstrumentPaymentRequest>,
) -> Response {
    payment_response(state.orchestrator.process_apple_pay_payment(request).await)
}

/// POST /api/payments/token
pub async fn create_token_payment(
    State(state): State<PaymentsState>,
    Json(request): Json<NewInstrumentPaymentRequest>,
) -> Response {
    payment_response(state.orchestrator.process_token_payment(request).await)
}

/// GET /api/payments/fee-preview
pub async fn fee_preview(
    State(state): State<PaymentsState>,
    Query(params): Query<FeePreviewQuery>,
) -> Result<Response, AppError> {
    let preview = state
        .fee_calculator
        .preview(
            params.merchant_id,
            params.base_amount_cents,
            &params.payment_type,
        )
        .await
        .map_err(|e| AppError::from(OrchestratorError::from(e)))?;

    Ok((StatusCode::OK, Json(preview)).into_response())
}

/// GET /api/payments/transactions/{id}
pub async fn get_transaction(
    State(state): State<PaymentsState>,
    Path(transaction_id): Path<Uuid>,
) -> Result<Json<TransactionView>, AppError> {
    let tx = state.orchestrator.get_transaction(transaction_id).await?;
    Ok(Json(TransactionView::from(tx)))
}

/// POST /api/payments/transactions/{id}/refund
pub async fn refund_transaction(
    State(state): State<PaymentsState>,
    Path(transaction_id): Path<Uuid>,
    body: Option<Json<RefundRequest>>,
) -> Result<Response, AppError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    info!(
        transaction_id = %transaction_id,
        amount_cents = ?request.amount_cents,
        "Refund request received"
    );

    let refund = state
        .orchestrator
        .refund_payment(transaction_id, request.amount_cents, request.reason)
        .await?;

    Ok((StatusCode::OK, Json(refund)).into_response())
}
