//! Services module for payment business logic

pub mod entity_status;
pub mod fee_calculation;
pub mod idempotency;
pub mod merchant_resolver;
pub mod payment_orchestrator;
pub mod transaction_ledger;
pub mod webhook_processor;

// Re-export orchestrator types
pub use crate::services::payment_orchestrator::{
    NewInstrumentPaymentRequest, OrchestrationState, OrchestratorConfig, OrchestratorError,
    OrchestratorResult, PaymentOrchestrator, PaymentResult, ProcessPaymentRequest, RefundResult,
};
pub use crate::services::webhook_processor::{
    WebhookAuth, WebhookOutcome, WebhookProcessor, WebhookProcessorError,
};
