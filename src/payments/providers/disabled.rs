use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentGateway;
use crate::payments::types::{
    CreateInstrumentRequest, InstrumentResult, ReversalRequest, ReversalResult, TransferRequest,
    TransferResult,
};
use async_trait::async_trait;

/// Gateway used when external services are switched off. It rejects every
/// call before anything leaves the process.
pub struct DisabledGateway;

fn refused() -> PaymentError {
    PaymentError::ProviderError {
        provider: "disabled".to_string(),
        message: "payment processor is disabled (SKIP_EXTERNALS=true)".to_string(),
        status_code: None,
        retryable: false,
    }
}

#[async_trait]
impl PaymentGateway for DisabledGateway {
    async fn create_payment_instrument(
        &self,
        _request: CreateInstrumentRequest,
    ) -> PaymentResult<InstrumentResult> {
        Err(refused())
    }

    async fn create_transfer(&self, _request: TransferRequest) -> PaymentResult<TransferResult> {
        Err(refused())
    }

    async fn create_reversal(&self, _request: ReversalRequest) -> PaymentResult<ReversalResult> {
        Err(refused())
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}
