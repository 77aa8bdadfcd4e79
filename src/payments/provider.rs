use crate::payments::error::PaymentResult;
use crate::payments::types::{
    CreateInstrumentRequest, InstrumentResult, ReversalRequest, ReversalResult, TransferRequest,
    TransferResult,
};
use async_trait::async_trait;

/// Seam between orchestration and the card/ACH processor.
///
/// Implementations never retry on their own. A declined charge surfaces as
/// `PaymentDeclinedError`, so a successful `create_transfer` always carries a
/// `SUCCEEDED` or `PENDING` transfer.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_instrument(
        &self,
        request: CreateInstrumentRequest,
    ) -> PaymentResult<InstrumentResult>;

    async fn create_transfer(&self, request: TransferRequest) -> PaymentResult<TransferResult>;

    async fn create_reversal(&self, request: ReversalRequest) -> PaymentResult<ReversalResult>;

    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::error::PaymentError;
    use crate::payments::types::{InstrumentDisplay, InstrumentSource, TransferState};
    use std::collections::BTreeMap;

    struct MockGateway;

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn create_payment_instrument(
            &self,
            request: CreateInstrumentRequest,
        ) -> PaymentResult<InstrumentResult> {
            Ok(InstrumentResult {
                instrument_id: "PImock".to_string(),
                instrument_type: request.source.processor_type().to_string(),
                display: InstrumentDisplay::default(),
                provider_data: None,
            })
        }

        async fn create_transfer(&self, request: TransferRequest) -> PaymentResult<TransferResult> {
            if request.amount_cents > 1_000_000 {
                return Err(PaymentError::PaymentDeclinedError {
                    message: "limit exceeded".to_string(),
                    failure_code: None,
                    transfer_id: None,
                });
            }
            Ok(TransferResult {
                transfer_id: format!("TR{}", request.operation_key),
                state: TransferState::Succeeded,
                amount_cents: request.amount_cents,
                provider_data: None,
            })
        }

        async fn create_reversal(&self, request: ReversalRequest) -> PaymentResult<ReversalResult> {
            Ok(ReversalResult {
                reversal_id: format!("RV{}", request.transfer_id),
                state: TransferState::Pending,
                amount_cents: request.amount_cents,
                provider_data: None,
            })
        }

        fn name(&self) -> &'static str {
            "mock"
        }
    }

    fn transfer(amount_cents: i64) -> TransferRequest {
        TransferRequest {
            amount_cents,
            currency: "USD".to_string(),
            merchant_id: "MUmock".to_string(),
            source_instrument_id: "PImock".to_string(),
            operation_key: "permit_1".to_string(),
            fraud_session_id: None,
            tags: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn trait_can_be_implemented_by_mock_gateway() {
        let gateway: Box<dyn PaymentGateway> = Box::new(MockGateway);

        let instrument = gateway
            .create_payment_instrument(CreateInstrumentRequest {
                source: InstrumentSource::GooglePay {
                    third_party_token: "tok".to_string(),
                },
                identity_id: "IDbuyer".to_string(),
                merchant_identity_id: Some("IDmerchant".to_string()),
                name: None,
                billing_address: None,
            })
            .await
            .expect("instrument creation should succeed");
        assert_eq!(instrument.instrument_type, "GOOGLE_PAY");

        let result = gateway
            .create_transfer(transfer(10_320))
            .await
            .expect("transfer should succeed");
        assert_eq!(result.state, TransferState::Succeeded);
        assert_eq!(result.amount_cents, 10_320);

        let declined = gateway.create_transfer(transfer(2_000_000)).await;
        assert!(matches!(
            declined,
            Err(PaymentError::PaymentDeclinedError { .. })
        ));
    }
}
