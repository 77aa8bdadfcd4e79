//! Unified Payment Orchestrator
//!
//! Turns "user wants to pay X for entity Y" into at most one charge against
//! the processor. Every attempt is written to the ledger before money moves;
//! the ledger row is deleted only while the processor cannot have acted on
//! it, and a paid row is never un-paid.

use crate::config::AppConfig;
use crate::database::entity_repository::{EntityRef, EntityType};
use crate::database::error::DatabaseError;
use crate::database::payment_method_repository::PaymentMethodStore;
use crate::database::transaction_repository::{
    PaymentStatus, PaymentTransaction, TransactionStatusUpdate,
};
use crate::error::{
    AppError, AppErrorKind, DomainError, ExternalError, InfrastructureError, ValidationError,
};
use crate::payments::error::PaymentError;
use crate::payments::provider::PaymentGateway;
use crate::payments::types::{
    BillingAddress, CreateInstrumentRequest, InstrumentResult, InstrumentSource, ReversalRequest,
    TransferRequest, TransferState,
};
use crate::services::entity_status::EntityStatusUpdater;
use crate::services::fee_calculation::{
    classify_payment_type, FeeError, FeePreviewError, PaymentTypeClass,
};
use crate::services::idempotency::{
    generate_operation_key, IdempotencyMetadata, KeySource, OperationKey, OperationKeyRequest,
};
use crate::services::merchant_resolver::{
    MerchantContext, MerchantResolutionError, MerchantResolver,
};
use crate::services::transaction_ledger::{
    LedgerError, PendingTransaction, StatusUpdateOutcome, TransactionLedger,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Failed attempts followed under one caller key before giving up.
const MAX_FAILED_ATTEMPTS: u32 = 20;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// ISO currency sent with every transfer
    pub currency: String,
    /// Deadline applied to each processor call
    pub gateway_timeout: Duration,
    /// Charges whose total exceeds this are rejected before the ledger insert
    pub max_transaction_cents: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            gateway_timeout: Duration::from_secs(30),
            max_transaction_cents: 10_000_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            currency: config.payments.currency.clone(),
            gateway_timeout: Duration::from_secs(config.finix.timeout_secs),
            max_transaction_cents: config.payments.max_transaction_cents,
        }
    }
}

// ============================================================================
// State Machine
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestrationState {
    Validating,
    DuplicateCheck,
    MerchantResolution,
    InstrumentResolution,
    /// Ledger row exists in `unpaid`
    TransactionCreated,
    TransferExecuted,
    TransactionFinalized,
    TransactionRolledBack,
}

impl std::fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OrchestrationState::Validating => "validating",
            OrchestrationState::DuplicateCheck => "duplicate_check",
            OrchestrationState::MerchantResolution => "merchant_resolution",
            OrchestrationState::InstrumentResolution => "instrument_resolution",
            OrchestrationState::TransactionCreated => "transaction_created",
            OrchestrationState::TransferExecuted => "transfer_executed",
            OrchestrationState::TransactionFinalized => "transaction_finalized",
            OrchestrationState::TransactionRolledBack => "transaction_rolled_back",
        };
        f.write_str(name)
    }
}

impl OrchestrationState {
    pub fn valid_transitions(&self) -> Vec<OrchestrationState> {
        match self {
            OrchestrationState::Validating => vec![OrchestrationState::DuplicateCheck],
            OrchestrationState::DuplicateCheck => vec![OrchestrationState::MerchantResolution],
            OrchestrationState::MerchantResolution => {
                vec![OrchestrationState::InstrumentResolution]
            }
            OrchestrationState::InstrumentResolution => {
                vec![OrchestrationState::TransactionCreated]
            }
            OrchestrationState::TransactionCreated => vec![
                OrchestrationState::TransferExecuted,
                OrchestrationState::TransactionRolledBack,
            ],
            OrchestrationState::TransferExecuted => {
                vec![OrchestrationState::TransactionFinalized]
            }
            // Terminal states - no valid transitions
            OrchestrationState::TransactionFinalized => vec![],
            OrchestrationState::TransactionRolledBack => vec![],
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationState::TransactionFinalized | OrchestrationState::TransactionRolledBack
        )
    }

    pub fn can_transition_to(&self, target: OrchestrationState) -> bool {
        self.valid_transitions().contains(&target)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("merchant {merchant_id} not found")]
    MerchantNotFound { merchant_id: Uuid },

    #[error("payment instrument {instrument_id} is unavailable")]
    InstrumentUnavailable { instrument_id: String },

    #[error("merchant {merchant_id} is not configured: {reason}")]
    NotConfigured { merchant_id: Uuid, reason: String },

    #[error("operation {operation_key} is already being processed")]
    DuplicateInFlight {
        operation_key: String,
        transaction_id: Option<Uuid>,
    },

    #[error("payment declined: {message}")]
    ProcessorDecline {
        message: String,
        failure_code: Option<String>,
    },

    /// `outcome_unknown` is set when the processor may have acted on the request.
    #[error("payment processor unavailable: {message}")]
    ProcessorTransient {
        message: String,
        retryable: bool,
        outcome_unknown: bool,
    },

    #[error("ledger error: {message}")]
    Persistence { message: String, retryable: bool },

    #[error("transaction {transaction_id} not found")]
    TransactionNotFound { transaction_id: Uuid },

    #[error("refund not allowed for {transaction_id}: {reason}")]
    InvalidRefund { transaction_id: Uuid, reason: String },
}

impl OrchestratorError {
    fn validation(field: &str, message: impl Into<String>) -> Self {
        OrchestratorError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::ProcessorTransient { retryable, .. } => *retryable,
            OrchestratorError::Persistence { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn user_message(&self) -> String {
        AppError::from(self.clone()).user_message()
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            OrchestratorError::Validation { .. } => "VALIDATION_ERROR",
            OrchestratorError::MerchantNotFound { .. } => "MERCHANT_NOT_FOUND",
            OrchestratorError::InstrumentUnavailable { .. } => "PAYMENT_INSTRUMENT_NOT_FOUND",
            OrchestratorError::NotConfigured { .. } => "MERCHANT_NOT_CONFIGURED",
            OrchestratorError::DuplicateInFlight { .. } => "DUPLICATE_IN_FLIGHT",
            OrchestratorError::ProcessorDecline { .. } => "PAYMENT_DECLINED",
            OrchestratorError::ProcessorTransient { .. } => "PAYMENT_PROCESSOR_ERROR",
            OrchestratorError::Persistence { .. } => "DATABASE_ERROR",
            OrchestratorError::TransactionNotFound { .. } => "TRANSACTION_NOT_FOUND",
            OrchestratorError::InvalidRefund { .. } => "INVALID_REFUND",
        }
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        let kind = match err {
            OrchestratorError::Validation { field, message } => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field,
                    reason: message,
                })
            }
            OrchestratorError::MerchantNotFound { merchant_id } => {
                AppErrorKind::Domain(DomainError::MerchantNotFound {
                    merchant_id: merchant_id.to_string(),
                })
            }
            OrchestratorError::InstrumentUnavailable { instrument_id } => {
                AppErrorKind::Domain(DomainError::PaymentInstrumentNotFound { instrument_id })
            }
            OrchestratorError::NotConfigured {
                merchant_id,
                reason,
            } => AppErrorKind::Domain(DomainError::MerchantNotConfigured {
                merchant_id: merchant_id.to_string(),
                reason,
            }),
            OrchestratorError::DuplicateInFlight { operation_key, .. } => {
                AppErrorKind::Domain(DomainError::DuplicateInFlight { operation_key })
            }
            OrchestratorError::ProcessorDecline { message, .. } => {
                AppErrorKind::Domain(DomainError::PaymentDeclined { reason: message })
            }
            OrchestratorError::ProcessorTransient {
                message, retryable, ..
            } => AppErrorKind::External(ExternalError::PaymentProcessor {
                processor: "finix".to_string(),
                message,
                is_retryable: retryable,
            }),
            OrchestratorError::Persistence { message, retryable } => {
                AppErrorKind::Infrastructure(InfrastructureError::Database {
                    message,
                    is_retryable: retryable,
                })
            }
            OrchestratorError::TransactionNotFound { transaction_id } => {
                AppErrorKind::Domain(DomainError::TransactionNotFound {
                    transaction_id: transaction_id.to_string(),
                })
            }
            OrchestratorError::InvalidRefund {
                transaction_id,
                reason,
            } => AppErrorKind::Domain(DomainError::InvalidRefund {
                transaction_id: transaction_id.to_string(),
                reason,
            }),
        };
        AppError::new(kind)
    }
}

impl From<PaymentError> for OrchestratorError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::ValidationError { message, field } => OrchestratorError::Validation {
                field: field.unwrap_or_else(|| "payment".to_string()),
                message,
            },
            PaymentError::PaymentDeclinedError {
                message,
                failure_code,
                ..
            } => OrchestratorError::ProcessorDecline {
                message,
                failure_code,
            },
            other => OrchestratorError::ProcessorTransient {
                message: other.to_string(),
                retryable: other.is_retryable(),
                outcome_unknown: other.outcome_unknown(),
            },
        }
    }
}

impl From<MerchantResolutionError> for OrchestratorError {
    fn from(err: MerchantResolutionError) -> Self {
        match err {
            MerchantResolutionError::NotFound(merchant_id) => {
                OrchestratorError::MerchantNotFound { merchant_id }
            }
            MerchantResolutionError::NotConfigured {
                merchant_id,
                reason,
            } => OrchestratorError::NotConfigured {
                merchant_id,
                reason,
            },
            MerchantResolutionError::Persistence(db) => db.into(),
        }
    }
}

impl From<LedgerError> for OrchestratorError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Validation { field, message } => {
                OrchestratorError::Validation { field, message }
            }
            LedgerError::DuplicateKey { operation_key } => OrchestratorError::DuplicateInFlight {
                operation_key,
                transaction_id: None,
            },
            LedgerError::NotFound(transaction_id) => {
                OrchestratorError::TransactionNotFound { transaction_id }
            }
            LedgerError::RollbackRefused { transaction_id } => OrchestratorError::Persistence {
                message: format!("transaction {} cannot be rolled back", transaction_id),
                retryable: false,
            },
            LedgerError::Persistence(db) => db.into(),
        }
    }
}

impl From<FeeError> for OrchestratorError {
    fn from(err: FeeError) -> Self {
        OrchestratorError::validation("base_amount_cents", err.to_string())
    }
}

impl From<FeePreviewError> for OrchestratorError {
    fn from(err: FeePreviewError) -> Self {
        match err {
            FeePreviewError::Merchant(err) => err.into(),
            FeePreviewError::Fee(err) => err.into(),
        }
    }
}

impl From<DatabaseError> for OrchestratorError {
    fn from(err: DatabaseError) -> Self {
        OrchestratorError::Persistence {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

// ============================================================================
// Requests and Results
// ============================================================================

/// Common entry point input. `payment_instrument_id` is either a processor
/// instrument id or the UUID of a stored payment method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessPaymentRequest {
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub merchant_id: Uuid,
    pub base_amount_cents: i64,
    #[serde(default)]
    pub payment_instrument_id: String,
    #[serde(default)]
    pub payment_type: String,
    pub user_id: Uuid,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub fraud_session_id: Option<String>,
    #[serde(default)]
    pub client_session_id: Option<String>,
    #[serde(default)]
    pub card_brand: Option<String>,
    #[serde(default)]
    pub card_last_four: Option<String>,
    #[serde(default)]
    pub bank_last_four: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    /// Stable key supplied by the caller so its own retries deduplicate
    #[serde(default)]
    pub operation_key: Option<String>,
    #[serde(default)]
    pub client_info: Option<JsonValue>,
}

impl ProcessPaymentRequest {
    fn full_name(&self) -> Option<String> {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join(" "))
    }
}

/// Wallet or tokenized-card checkout: the instrument is created first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInstrumentPaymentRequest {
    #[serde(flatten)]
    pub payment: ProcessPaymentRequest,
    /// Finix.js token or the wallet's third-party token
    pub token: String,
    /// Buyer identity on the processor
    pub identity_id: String,
    #[serde(default)]
    pub billing_address: Option<BillingAddress>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processor_transfer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processor_instrument_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_fee_cents: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_amount_cents: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TransferState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub retryable: bool,
    pub duplicate_prevented: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl PaymentResult {
    fn from_transaction(tx: &PaymentTransaction) -> Self {
        Self {
            success: tx.payment_status != PaymentStatus::Failed,
            transaction_id: Some(tx.id),
            processor_transfer_id: tx.finix_transfer_id.clone(),
            processor_instrument_id: Some(tx.finix_payment_instrument_id.clone()),
            service_fee_cents: Some(tx.service_fee_cents),
            total_amount_cents: Some(tx.total_amount_cents),
            status: Some(tx.transfer_state),
            ..Default::default()
        }
    }

    pub fn failure(err: &OrchestratorError) -> Self {
        let transaction_id = match err {
            OrchestratorError::DuplicateInFlight { transaction_id, .. } => *transaction_id,
            _ => None,
        };
        Self {
            success: false,
            transaction_id,
            error: Some(err.user_message()),
            error_code: Some(err.error_code().to_string()),
            retryable: err.is_retryable(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundResult {
    pub transaction_id: Uuid,
    pub reversal_id: String,
    pub state: TransferState,
    pub amount_cents: i64,
    pub refunded_total_cents: i64,
    pub remaining_refundable_cents: i64,
}

/// Where the duplicate check left an operation key.
enum PriorAttempt {
    /// Nothing recorded that blocks a charge under `key`
    Open {
        key: OperationKey,
        previous: Option<OperationKey>,
    },
    Paid(PaymentTransaction),
}

/// Processor-side instrument plus the display fields recorded on the ledger.
struct ResolvedInstrument {
    finix_id: String,
    payment_type: String,
    card_brand: Option<String>,
    card_last_four: Option<String>,
    bank_last_four: Option<String>,
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct PaymentOrchestrator {
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<TransactionLedger>,
    merchants: Arc<MerchantResolver>,
    payment_methods: Arc<dyn PaymentMethodStore>,
    fulfillment: Arc<EntityStatusUpdater>,
    config: OrchestratorConfig,
}

impl PaymentOrchestrator {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<TransactionLedger>,
        merchants: Arc<MerchantResolver>,
        payment_methods: Arc<dyn PaymentMethodStore>,
        fulfillment: Arc<EntityStatusUpdater>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            gateway,
            ledger,
            merchants,
            payment_methods,
            fulfillment,
            config,
        }
    }

    fn transition(&self, state: &mut OrchestrationState, next: OrchestrationState, key: &str) {
        if !state.can_transition_to(next) {
            error!(from = %state, to = %next, operation_key = %key, "invalid orchestration transition");
        }
        info!(from = %state, to = %next, operation_key = %key, "orchestration state transitioned");
        *state = next;
    }

    async fn with_deadline<T>(
        &self,
        call: impl Future<Output = Result<T, PaymentError>>,
    ) -> Result<T, PaymentError> {
        match tokio::time::timeout(self.config.gateway_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(PaymentError::TimeoutError {
                message: format!("{} did not respond", self.gateway.name()),
                timeout_secs: self.config.gateway_timeout.as_secs(),
            }),
        }
    }

    /// Charges an existing instrument. Never returns an error; failures are
    /// reported in the result with a retry hint.
    pub async fn process_payment(&self, request: ProcessPaymentRequest) -> PaymentResult {
        match self.execute(request).await {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, retryable = err.is_retryable(), "payment failed");
                PaymentResult::failure(&err)
            }
        }
    }

    /// Front door for a stored or processor instrument.
    pub async fn process_instrument_payment(&self, request: ProcessPaymentRequest) -> PaymentResult {
        if request.payment_instrument_id.trim().is_empty() {
            return PaymentResult::failure(&OrchestratorError::validation(
                "payment_instrument_id",
                "payment instrument is required",
            ));
        }
        self.process_payment(request).await
    }

    pub async fn process_google_pay_payment(
        &self,
        request: NewInstrumentPaymentRequest,
    ) -> PaymentResult {
        let source = InstrumentSource::GooglePay {
            third_party_token: request.token.clone(),
        };
        self.process_with_new_instrument(source, request).await
    }

    pub async fn process_apple_pay_payment(
        &self,
        request: NewInstrumentPaymentRequest,
    ) -> PaymentResult {
        let source = InstrumentSource::ApplePay {
            third_party_token: request.token.clone(),
        };
        self.process_with_new_instrument(source, request).await
    }

    /// Guest checkout with a Finix.js token for a card or bank account.
    pub async fn process_token_payment(&self, request: NewInstrumentPaymentRequest) -> PaymentResult {
        let source = InstrumentSource::Token {
            token: request.token.clone(),
        };
        self.process_with_new_instrument(source, request).await
    }

    async fn process_with_new_instrument(
        &self,
        source: InstrumentSource,
        request: NewInstrumentPaymentRequest,
    ) -> PaymentResult {
        // A replayed key must not mint another processor instrument
        if let Some(supplied) = request.payment.operation_key.as_deref() {
            let prior = match OperationKey::parse(supplied) {
                Ok(key) => {
                    self.check_prior_attempts(
                        key,
                        KeySource::CallerSupplied,
                        &Self::key_request(&request.payment),
                    )
                    .await
                }
                Err(message) => Err(OrchestratorError::validation("operation_key", message)),
            };
            match prior {
                Ok(PriorAttempt::Open { .. }) => {}
                Ok(PriorAttempt::Paid(existing)) => return Self::duplicate_result(&existing),
                Err(err) => {
                    warn!(error = %err, "payment rejected before instrument creation");
                    return PaymentResult::failure(&err);
                }
            }
        }

        match self.create_instrument(&source, &request).await {
            Ok(instrument) => {
                let mut payment = request.payment;
                payment.payment_type = match source {
                    InstrumentSource::Token { .. } => instrument.instrument_type.clone(),
                    _ => source.payment_type().to_string(),
                };
                if payment.card_brand.is_none() {
                    payment.card_brand = instrument.display.brand.clone();
                }
                if payment.card_last_four.is_none() && payment.bank_last_four.is_none() {
                    match classify_payment_type(&payment.payment_type) {
                        PaymentTypeClass::Card => {
                            payment.card_last_four = instrument.display.last_four.clone()
                        }
                        PaymentTypeClass::Bank => {
                            payment.bank_last_four = instrument.display.last_four.clone()
                        }
                    }
                }
                payment.payment_instrument_id = instrument.instrument_id;
                self.process_payment(payment).await
            }
            Err(err) => {
                warn!(
                    instrument_type = source.processor_type(),
                    error = %err,
                    "payment instrument creation failed"
                );
                PaymentResult::failure(&err)
            }
        }
    }

    async fn create_instrument(
        &self,
        source: &InstrumentSource,
        request: &NewInstrumentPaymentRequest,
    ) -> OrchestratorResult<InstrumentResult> {
        if request.token.trim().is_empty() {
            return Err(OrchestratorError::validation("token", "token is required"));
        }
        if request.identity_id.trim().is_empty() {
            return Err(OrchestratorError::validation(
                "identity_id",
                "buyer identity is required",
            ));
        }
        self.validate(&request.payment)?;

        let merchant = self
            .merchants
            .resolve_merchant(request.payment.merchant_id)
            .await?;
        let merchant_identity_id = match source {
            InstrumentSource::Token { .. } => None,
            _ => Some(merchant.finix_identity_id.clone()),
        };

        let instrument = self
            .with_deadline(self.gateway.create_payment_instrument(CreateInstrumentRequest {
                source: source.clone(),
                identity_id: request.identity_id.clone(),
                merchant_identity_id,
                name: request.payment.full_name(),
                billing_address: request.billing_address.clone(),
            }))
            .await?;

        info!(
            instrument_id = %instrument.instrument_id,
            instrument_type = %instrument.instrument_type,
            "payment instrument created"
        );
        Ok(instrument)
    }

    fn validate(&self, request: &ProcessPaymentRequest) -> OrchestratorResult<()> {
        if request.base_amount_cents <= 0 {
            return Err(FeeError::NonPositiveAmount.into());
        }
        if request.base_amount_cents > self.config.max_transaction_cents {
            return Err(FeeError::AboveLimit {
                amount_cents: request.base_amount_cents,
                limit_cents: self.config.max_transaction_cents,
            }
            .into());
        }
        if request.entity_id.is_nil() {
            return Err(OrchestratorError::validation("entity_id", "entity id is required"));
        }
        if request.merchant_id.is_nil() {
            return Err(OrchestratorError::validation(
                "merchant_id",
                "merchant id is required",
            ));
        }
        if request.user_id.is_nil() {
            return Err(OrchestratorError::validation("user_id", "user id is required"));
        }
        Ok(())
    }

    fn key_request(request: &ProcessPaymentRequest) -> OperationKeyRequest {
        OperationKeyRequest {
            entity_type: request.entity_type,
            entity_id: request.entity_id,
            user_id: request.user_id,
            session_id: request.client_session_id.clone(),
            base_amount_cents: request.base_amount_cents,
            payment_instrument_id: request.payment_instrument_id.clone(),
        }
    }

    fn duplicate_result(existing: &PaymentTransaction) -> PaymentResult {
        info!(
            operation_key = %existing.idempotency_key,
            transaction_id = %existing.id,
            "duplicate of a completed payment, returning recorded outcome"
        );
        let mut result = PaymentResult::from_transaction(existing);
        result.duplicate_prevented = true;
        result
    }

    /// Walks the attempts recorded under `key`. A failed attempt passes the
    /// charge on to its successor key: `<key>:retry-<n>` for caller keys, a
    /// fresh random key otherwise.
    async fn check_prior_attempts(
        &self,
        key: OperationKey,
        source: KeySource,
        key_request: &OperationKeyRequest,
    ) -> OrchestratorResult<PriorAttempt> {
        let root = key.clone();
        let mut key = key;
        let mut previous = None;
        let mut failed_attempts = 0;

        while let Some(existing) = self.ledger.find_by_operation_key(&key).await? {
            match existing.payment_status {
                PaymentStatus::Paid => return Ok(PriorAttempt::Paid(existing)),
                PaymentStatus::Unpaid => {
                    return Err(OrchestratorError::DuplicateInFlight {
                        operation_key: key.to_string(),
                        transaction_id: Some(existing.id),
                    });
                }
                PaymentStatus::Failed => {
                    failed_attempts += 1;
                    if failed_attempts > MAX_FAILED_ATTEMPTS {
                        return Err(OrchestratorError::validation(
                            "operation_key",
                            "too many failed attempts under this operation key",
                        ));
                    }
                    let next = match source {
                        KeySource::CallerSupplied => root
                            .retry(failed_attempts)
                            .map_err(|message| OrchestratorError::validation("operation_key", message))?,
                        KeySource::Generated => generate_operation_key(key_request),
                    };
                    info!(
                        previous_operation_key = %key,
                        operation_key = %next,
                        "previous attempt failed, continuing under successor key"
                    );
                    previous = Some(key);
                    key = next;
                }
            }
        }

        Ok(PriorAttempt::Open { key, previous })
    }

    async fn execute(&self, request: ProcessPaymentRequest) -> OrchestratorResult<PaymentResult> {
        let mut state = OrchestrationState::Validating;

        self.validate(&request)?;
        if request.payment_instrument_id.trim().is_empty() {
            return Err(OrchestratorError::validation(
                "payment_instrument_id",
                "payment instrument is required",
            ));
        }

        let key_request = Self::key_request(&request);
        let (key, key_source) = match request.operation_key.as_deref() {
            Some(supplied) => (
                OperationKey::parse(supplied)
                    .map_err(|message| OrchestratorError::validation("operation_key", message))?,
                KeySource::CallerSupplied,
            ),
            None => (generate_operation_key(&key_request), KeySource::Generated),
        };
        let mut metadata = IdempotencyMetadata::for_request(
            &key_request,
            key_source,
            &request.payment_type,
            request.client_info.clone(),
        );

        self.transition(&mut state, OrchestrationState::DuplicateCheck, key.as_str());
        let key = match self
            .check_prior_attempts(key, key_source, &key_request)
            .await?
        {
            PriorAttempt::Paid(existing) => return Ok(Self::duplicate_result(&existing)),
            PriorAttempt::Open { key, previous } => {
                metadata.previous_operation_key = previous.map(|k| k.to_string());
                key
            }
        };

        self.transition(&mut state, OrchestrationState::MerchantResolution, key.as_str());
        let merchant = self.merchants.resolve_merchant(request.merchant_id).await?;

        self.transition(&mut state, OrchestrationState::InstrumentResolution, key.as_str());
        let instrument = self.resolve_instrument(&request).await?;
        metadata.payment_type = instrument.payment_type.clone();

        let tx = self
            .ledger
            .create_pending(
                PendingTransaction {
                    operation_key: key.clone(),
                    metadata,
                    entity: EntityRef {
                        entity_type: request.entity_type,
                        entity_id: request.entity_id,
                    },
                    merchant_id: merchant.merchant_id,
                    user_id: request.user_id,
                    customer_id: merchant.customer_id.clone(),
                    base_amount_cents: request.base_amount_cents,
                    currency: self.config.currency.clone(),
                    payment_type: instrument.payment_type.clone(),
                    finix_payment_instrument_id: instrument.finix_id.clone(),
                    card_brand: instrument.card_brand.clone(),
                    card_last_four: instrument.card_last_four.clone(),
                    bank_last_four: instrument.bank_last_four.clone(),
                    fraud_session_id: request.fraud_session_id.clone(),
                    customer_email: request.user_email.clone(),
                },
                &merchant.fee_schedule,
            )
            .await?;
        self.transition(&mut state, OrchestrationState::TransactionCreated, key.as_str());

        let transfer_request = self.transfer_request(&tx, &merchant, &key);
        let transfer = match self
            .with_deadline(self.gateway.create_transfer(transfer_request))
            .await
        {
            Ok(transfer) => transfer,
            Err(err) if err.outcome_unknown() => {
                // The processor may hold a transfer under this key; keep the
                // row so the webhook can settle it.
                warn!(
                    transaction_id = %tx.id,
                    operation_key = %key,
                    error = %err,
                    "transfer outcome unknown, leaving transaction pending"
                );
                let mut result = match err.resource_id() {
                    Some(transfer_id) => self.link_unconfirmed_transfer(&tx, transfer_id).await,
                    None => PaymentResult::from_transaction(&tx),
                };
                result.success = false;
                result.status = Some(TransferState::Pending);
                result.error = Some(err.user_message());
                result.error_code = Some("PAYMENT_OUTCOME_UNKNOWN".to_string());
                result.retryable = false;
                return Ok(result);
            }
            Err(err) => {
                self.transition(&mut state, OrchestrationState::TransactionRolledBack, key.as_str());
                if let Err(rollback_err) = self.ledger.rollback(tx.id).await {
                    error!(
                        transaction_id = %tx.id,
                        error = %rollback_err,
                        "rollback of failed attempt did not complete"
                    );
                }
                if let PaymentError::PaymentDeclinedError {
                    transfer_id: Some(transfer_id),
                    ..
                } = &err
                {
                    info!(transaction_id = %tx.id, transfer_id = %transfer_id, "transfer declined");
                }
                return Err(err.into());
            }
        };
        self.transition(&mut state, OrchestrationState::TransferExecuted, key.as_str());

        let mut update = TransactionStatusUpdate::new(tx.id, transfer.state);
        update.finix_transfer_id = Some(transfer.transfer_id.clone());
        update.finix_payment_instrument_id = Some(instrument.finix_id.clone());
        update.raw_finix_response = transfer.provider_data.clone();

        let mut warnings = Vec::new();
        let finalized = match self.ledger.update_status(&update).await {
            Ok(StatusUpdateOutcome::Applied(updated)) => {
                if updated.payment_status == PaymentStatus::Paid {
                    let report = self.fulfillment.fulfill(&updated).await;
                    warnings.extend(report.warnings);
                }
                updated
            }
            Ok(StatusUpdateOutcome::AlreadyApplied(current)) => current,
            Ok(StatusUpdateOutcome::Rejected(current)) => {
                error!(
                    transaction_id = %tx.id,
                    transfer_id = %transfer.transfer_id,
                    ledger_status = current.payment_status.as_str(),
                    transfer_state = transfer.state.as_str(),
                    "ledger disagrees with processor transfer state"
                );
                warnings.push("ledger state differs from processor state".to_string());
                current
            }
            Err(err) => {
                // Money moved; the webhook reconciles the row later.
                error!(
                    transaction_id = %tx.id,
                    transfer_id = %transfer.transfer_id,
                    error = %err,
                    "failed to record transfer on ledger"
                );
                warnings.push("payment recorded for later reconciliation".to_string());
                let mut result = PaymentResult::from_transaction(&tx);
                result.processor_transfer_id = Some(transfer.transfer_id.clone());
                result.status = Some(transfer.state);
                result.warnings = warnings;
                return Ok(result);
            }
        };
        self.transition(&mut state, OrchestrationState::TransactionFinalized, key.as_str());

        info!(
            transaction_id = %finalized.id,
            transfer_id = %transfer.transfer_id,
            transfer_state = transfer.state.as_str(),
            total_amount_cents = finalized.total_amount_cents,
            "payment processed"
        );

        let mut result = PaymentResult::from_transaction(&finalized);
        result.status = Some(transfer.state);
        result.processor_transfer_id = Some(transfer.transfer_id);
        result.warnings = warnings;
        Ok(result)
    }

    /// Records a transfer id from an unreadable response while leaving the row
    /// unpaid for the webhook.
    async fn link_unconfirmed_transfer(
        &self,
        tx: &PaymentTransaction,
        transfer_id: &str,
    ) -> PaymentResult {
        let mut update = TransactionStatusUpdate::new(tx.id, TransferState::Pending);
        update.finix_transfer_id = Some(transfer_id.to_string());
        match self.ledger.update_status(&update).await {
            Ok(outcome) => PaymentResult::from_transaction(outcome.transaction()),
            Err(err) => {
                error!(
                    transaction_id = %tx.id,
                    transfer_id = %transfer_id,
                    error = %err,
                    "failed to link unconfirmed transfer"
                );
                let mut result = PaymentResult::from_transaction(tx);
                result.processor_transfer_id = Some(transfer_id.to_string());
                result
            }
        }
    }

    fn transfer_request(
        &self,
        tx: &PaymentTransaction,
        merchant: &MerchantContext,
        key: &OperationKey,
    ) -> TransferRequest {
        let mut tags = BTreeMap::new();
        tags.insert("entity_type".to_string(), tx.entity_type.to_string());
        tags.insert("entity_id".to_string(), tx.entity_id.to_string());
        tags.insert("user_id".to_string(), tx.user_id.to_string());
        tags.insert("transaction_id".to_string(), tx.id.to_string());
        tags.insert("merchant_id".to_string(), merchant.merchant_id.to_string());

        TransferRequest {
            amount_cents: tx.total_amount_cents,
            currency: tx.currency.clone(),
            merchant_id: merchant.finix_merchant_id.clone(),
            source_instrument_id: tx.finix_payment_instrument_id.clone(),
            operation_key: key.to_string(),
            fraud_session_id: tx.fraud_session_id.clone(),
            tags,
        }
    }

    /// UUIDs refer to stored payment methods and must belong to the caller
    /// and be enabled; anything else is taken as a processor instrument id.
    async fn resolve_instrument(
        &self,
        request: &ProcessPaymentRequest,
    ) -> OrchestratorResult<ResolvedInstrument> {
        let reference = request.payment_instrument_id.trim();

        let resolved = match Uuid::parse_str(reference) {
            Ok(stored_id) => {
                let method = self
                    .payment_methods
                    .find_for_user(stored_id, request.user_id)
                    .await?
                    .filter(|m| m.is_enabled)
                    .ok_or_else(|| OrchestratorError::InstrumentUnavailable {
                        instrument_id: reference.to_string(),
                    })?;
                ResolvedInstrument {
                    finix_id: method.finix_payment_instrument_id,
                    payment_type: if request.payment_type.trim().is_empty() {
                        method.method_type
                    } else {
                        request.payment_type.clone()
                    },
                    card_brand: request.card_brand.clone().or(method.card_brand),
                    card_last_four: request.card_last_four.clone().or(method.card_last_four),
                    bank_last_four: request.bank_last_four.clone().or(method.account_last_four),
                }
            }
            Err(_) => ResolvedInstrument {
                finix_id: reference.to_string(),
                payment_type: request.payment_type.clone(),
                card_brand: request.card_brand.clone(),
                card_last_four: request.card_last_four.clone(),
                bank_last_four: request.bank_last_four.clone(),
            },
        };

        if resolved.payment_type.trim().is_empty() {
            return Err(OrchestratorError::validation(
                "payment_type",
                "payment type is required",
            ));
        }
        Ok(resolved)
    }

    /// Full or partial refund of a paid transaction.
    pub async fn refund_payment(
        &self,
        transaction_id: Uuid,
        amount_cents: Option<i64>,
        reason: Option<String>,
    ) -> OrchestratorResult<RefundResult> {
        let tx = self
            .ledger
            .find_by_id(transaction_id)
            .await?
            .ok_or(OrchestratorError::TransactionNotFound { transaction_id })?;

        let invalid = |reason: &str| OrchestratorError::InvalidRefund {
            transaction_id,
            reason: reason.to_string(),
        };

        if tx.payment_status != PaymentStatus::Paid {
            return Err(invalid("only paid transactions can be refunded"));
        }
        let transfer_id = tx
            .finix_transfer_id
            .clone()
            .ok_or_else(|| invalid("transaction has no processor transfer"))?;
        let refundable = tx.refundable_cents();
        let amount = amount_cents.unwrap_or(refundable);
        if amount <= 0 {
            return Err(invalid("refund amount must be positive"));
        }
        if amount > refundable {
            return Err(invalid("refund exceeds the remaining refundable amount"));
        }

        let operation_key = format!("refund_{}", Uuid::new_v4().simple());
        let reversal = self
            .with_deadline(self.gateway.create_reversal(ReversalRequest {
                transfer_id: transfer_id.clone(),
                amount_cents: amount,
                reason,
                operation_key: operation_key.clone(),
            }))
            .await?;

        info!(
            transaction_id = %transaction_id,
            transfer_id = %transfer_id,
            reversal_id = %reversal.reversal_id,
            amount_cents = amount,
            "refund created"
        );

        let refunded_total = match self.ledger.record_refund(transaction_id, amount).await {
            Ok(Some(updated)) => updated.refunded_amount_cents,
            Ok(None) => {
                warn!(
                    transaction_id = %transaction_id,
                    reversal_id = %reversal.reversal_id,
                    "refund accepted by processor but exceeded ledger refundable amount"
                );
                tx.refunded_amount_cents + amount
            }
            Err(err) => {
                error!(
                    transaction_id = %transaction_id,
                    reversal_id = %reversal.reversal_id,
                    error = %err,
                    "failed to record refund on ledger"
                );
                tx.refunded_amount_cents + amount
            }
        };

        Ok(RefundResult {
            transaction_id,
            reversal_id: reversal.reversal_id,
            state: reversal.state,
            amount_cents: amount,
            refunded_total_cents: refunded_total,
            remaining_refundable_cents: (tx.total_amount_cents - refunded_total).max(0),
        })
    }

    pub async fn get_transaction(&self, transaction_id: Uuid) -> OrchestratorResult<PaymentTransaction> {
        self.ledger
            .find_by_id(transaction_id)
            .await?
            .ok_or(OrchestratorError::TransactionNotFound { transaction_id })
    }
}
