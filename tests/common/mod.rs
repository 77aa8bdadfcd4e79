#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use municipal_payments::database::entity_repository::EntityType;
use municipal_payments::database::memory::InMemoryStore;
use municipal_payments::database::merchant_repository::Merchant;
use municipal_payments::payments::error::{PaymentError, PaymentResult};
use municipal_payments::payments::provider::PaymentGateway;
use municipal_payments::payments::types::{
    CreateInstrumentRequest, InstrumentDisplay, InstrumentResult, ReversalRequest,
    ReversalResult, TransferRequest, TransferResult, TransferState,
};
use municipal_payments::services::entity_status::EntityStatusUpdater;
use municipal_payments::services::merchant_resolver::MerchantResolver;
use municipal_payments::services::transaction_ledger::TransactionLedger;
use municipal_payments::services::{
    OrchestratorConfig, PaymentOrchestrator, ProcessPaymentRequest, WebhookAuth, WebhookProcessor,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const WEBHOOK_TOKEN: &str = "whk_test_token";
pub const FINIX_MERCHANT_ID: &str = "MUtestmerchant";
pub const FINIX_IDENTITY_ID: &str = "IDtestmerchant";

/// What the mock processor does with the next transfers.
#[derive(Debug, Clone)]
pub enum TransferBehavior {
    Succeed,
    Pending,
    Decline,
    /// Connection refused before the request left
    Unreachable,
    /// Never answers within the orchestrator deadline
    Hang,
}

pub struct MockGateway {
    behavior: Mutex<TransferBehavior>,
    counter: AtomicUsize,
    pub transfers: Mutex<Vec<TransferRequest>>,
    pub reversals: Mutex<Vec<ReversalRequest>>,
    pub instruments: Mutex<Vec<CreateInstrumentRequest>>,
    /// `instrument_type` reported for tokenized instruments
    pub token_instrument_type: Mutex<String>,
}

impl MockGateway {
    pub fn new(behavior: TransferBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            counter: AtomicUsize::new(0),
            transfers: Mutex::new(Vec::new()),
            reversals: Mutex::new(Vec::new()),
            instruments: Mutex::new(Vec::new()),
            token_instrument_type: Mutex::new("PAYMENT_CARD".to_string()),
        }
    }

    pub fn set_behavior(&self, behavior: TransferBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.lock().unwrap().len()
    }

    pub fn last_transfer(&self) -> TransferRequest {
        self.transfers
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no transfer recorded")
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_payment_instrument(
        &self,
        request: CreateInstrumentRequest,
    ) -> PaymentResult<InstrumentResult> {
        let instrument_type = match request.source.processor_type() {
            "TOKEN" => self.token_instrument_type.lock().unwrap().clone(),
            other => other.to_string(),
        };
        self.instruments.lock().unwrap().push(request);
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(InstrumentResult {
            instrument_id: format!("PInew{}", n),
            instrument_type,
            display: InstrumentDisplay {
                brand: Some("VISA".to_string()),
                last_four: Some("4242".to_string()),
                expiration_month: Some(12),
                expiration_year: Some(2030),
            },
            provider_data: None,
        })
    }

    async fn create_transfer(&self, request: TransferRequest) -> PaymentResult<TransferResult> {
        self.transfers.lock().unwrap().push(request.clone());
        let behavior = self.behavior.lock().unwrap().clone();
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let transfer_id = format!("TRmock{}", n);

        match behavior {
            TransferBehavior::Succeed | TransferBehavior::Pending => Ok(TransferResult {
                transfer_id: transfer_id.clone(),
                state: if matches!(behavior, TransferBehavior::Succeed) {
                    TransferState::Succeeded
                } else {
                    TransferState::Pending
                },
                amount_cents: request.amount_cents,
                provider_data: Some(serde_json::json!({
                    "id": transfer_id,
                    "idempotency_id": request.operation_key,
                })),
            }),
            TransferBehavior::Decline => Err(PaymentError::PaymentDeclinedError {
                message: "Insufficient funds".to_string(),
                failure_code: Some("INSUFFICIENT_FUNDS".to_string()),
                transfer_id: Some(transfer_id),
            }),
            TransferBehavior::Unreachable => Err(PaymentError::NetworkError {
                message: "connection refused".to_string(),
                request_sent: false,
            }),
            TransferBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Err(PaymentError::NetworkError {
                    message: "hung".to_string(),
                    request_sent: true,
                })
            }
        }
    }

    async fn create_reversal(&self, request: ReversalRequest) -> PaymentResult<ReversalResult> {
        self.reversals.lock().unwrap().push(request.clone());
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

pub fn merchant(id: Uuid) -> Merchant {
    let now = Utc::now();
    Merchant {
        id,
        merchant_name: "City of Springfield".to_string(),
        finix_merchant_id: Some(FINIX_MERCHANT_ID.to_string()),
        finix_identity_id: Some(FINIX_IDENTITY_ID.to_string()),
        category: Some("permits".to_string()),
        subcategory: None,
        customer_id: Some("cust_42".to_string()),
        basis_points: 290,
        fixed_fee: 30,
        ach_basis_points: 80,
        ach_fixed_fee: 0,
        onboarding_state: Some("APPROVED".to_string()),
        processing_enabled: true,
        created_at: now,
        updated_at: now,
    }
}

/// Orchestrator, webhook processor and store wired the way `main` wires them.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub gateway: Arc<MockGateway>,
    pub ledger: Arc<TransactionLedger>,
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub webhooks: Arc<WebhookProcessor>,
    pub merchant_id: Uuid,
    pub user_id: Uuid,
}

impl Harness {
    pub async fn new(behavior: TransferBehavior) -> Self {
        Self::with_timeout(behavior, Duration::from_secs(2)).await
    }

    pub async fn with_timeout(behavior: TransferBehavior, gateway_timeout: Duration) -> Self {
        let gateway = Arc::new(MockGateway::new(behavior));
        Self::build(gateway.clone(), gateway, gateway_timeout).await
    }

    /// Charges go to `processor` instead of the mock; `gateway` stays idle.
    pub async fn with_gateway(processor: Arc<dyn PaymentGateway>) -> Self {
        let idle = Arc::new(MockGateway::new(TransferBehavior::Succeed));
        Self::build(processor, idle, Duration::from_secs(5)).await
    }

    async fn build(
        processor: Arc<dyn PaymentGateway>,
        gateway: Arc<MockGateway>,
        gateway_timeout: Duration,
    ) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let merchant_id = Uuid::new_v4();
        store.insert_merchant(merchant(merchant_id)).await;

        let ledger = Arc::new(TransactionLedger::new(store.clone(), 10_000_000));
        let resolver = Arc::new(MerchantResolver::new(store.clone()));
        let fulfillment = Arc::new(EntityStatusUpdater::new(store.clone(), store.clone()));
        let orchestrator = Arc::new(PaymentOrchestrator::new(
            processor,
            ledger.clone(),
            resolver,
            store.clone(),
            fulfillment.clone(),
            OrchestratorConfig {
                gateway_timeout,
                ..OrchestratorConfig::default()
            },
        ));
        let webhooks = Arc::new(WebhookProcessor::new(
            store.clone(),
            ledger.clone(),
            store.clone(),
            store.clone(),
            fulfillment,
            WebhookAuth {
                bearer_token: WEBHOOK_TOKEN.to_string(),
                signing_key: None,
            },
            5,
        ));

        Self {
            store,
            gateway,
            ledger,
            orchestrator,
            webhooks,
            merchant_id,
            user_id: Uuid::new_v4(),
        }
    }

    /// Card charge of $100.00 against a fresh entity row in `status`.
    pub async fn request(
        &self,
        entity_type: EntityType,
        status: &str,
    ) -> ProcessPaymentRequest {
        let entity_id = Uuid::new_v4();
        self.store.insert_entity(entity_type, entity_id, status).await;
        self.request_for(entity_type, entity_id)
    }

    pub fn request_for(&self, entity_type: EntityType, entity_id: Uuid) -> ProcessPaymentRequest {
        ProcessPaymentRequest {
            entity_type,
            entity_id,
            merchant_id: self.merchant_id,
            base_amount_cents: 10_000,
            payment_instrument_id: "PIcard123".to_string(),
            payment_type: "card".to_string(),
            user_id: self.user_id,
            user_email: Some("resident@example.com".to_string()),
            fraud_session_id: Some("fs_1".to_string()),
            client_session_id: Some("sess_1".to_string()),
            card_brand: Some("VISA".to_string()),
            card_last_four: Some("4242".to_string()),
            bank_last_four: None,
            first_name: Some("Ada".to_string()),
            last_name: Some("Lovelace".to_string()),
            operation_key: None,
            client_info: None,
        }
    }
}

/// A transfer webhook in the shape the processor sends.
pub fn transfer_event(
    event_id: &str,
    transfer_id: &str,
    state: &str,
    occurred_at: chrono::DateTime<Utc>,
    tags: serde_json::Value,
    idempotency_id: Option<&str>,
) -> serde_json::Value {
    serde_json::json!({
        "id": event_id,
        "type": "updated",
        "entity": "transfer",
        "occurred_at": occurred_at.to_rfc3339(),
        "_embedded": {
            "transfers": [{
                "id": transfer_id,
                "state": state,
                "amount": 10_320,
                "idempotency_id": idempotency_id,
                "tags": tags,
                "type": "DEBIT"
            }]
        }
    })
}
