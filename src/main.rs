use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use dotenv::dotenv;
use municipal_payments::api::{self, PaymentsState, WebhookState};
use municipal_payments::config::AppConfig;
use municipal_payments::database::memory::InMemoryStore;
use municipal_payments::database::{init_pool_from_config, Stores};
use municipal_payments::health::{HealthChecker, HealthState};
use municipal_payments::logging::init_tracing;
use municipal_payments::middleware::logging::{request_logging_middleware, UuidRequestId};
use municipal_payments::payments::providers::{DisabledGateway, FinixGateway};
use municipal_payments::payments::PaymentGateway;
use municipal_payments::services::entity_status::EntityStatusUpdater;
use municipal_payments::services::fee_calculation::FeeCalculator;
use municipal_payments::services::merchant_resolver::MerchantResolver;
use municipal_payments::services::transaction_ledger::TransactionLedger;
use municipal_payments::services::{
    OrchestratorConfig, PaymentOrchestrator, WebhookAuth, WebhookProcessor,
};
use municipal_payments::workers::webhook_retry::WebhookRetryWorker;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

async fn root() -> &'static str {
    "municipal payments"
}

async fn health(State(checker): State<HealthChecker>) -> impl IntoResponse {
    let status = checker.check_health().await;
    let code = match status.status {
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(status))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let config = AppConfig::from_env()?;
    init_tracing(&config.logging);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        skip_externals = config.skip_externals,
        "Starting municipal payments service"
    );

    // Stores and gateway
    let (stores, db_pool, gateway): (Stores, _, Arc<dyn PaymentGateway>) =
        if config.skip_externals {
            warn!("SKIP_EXTERNALS=true: using in-memory store and a disabled payment gateway");
            (
                Stores::in_memory(Arc::new(InMemoryStore::new())),
                None,
                Arc::new(DisabledGateway) as Arc<dyn PaymentGateway>,
            )
        } else {
            info!("Initializing database connection pool...");
            let pool = init_pool_from_config(&config.database).await.map_err(|e| {
                error!("Failed to initialize database pool: {}", e);
                e
            })?;
            let gateway = FinixGateway::new(&config.finix)?;
            info!(base_url = %config.finix.base_url, "Finix gateway configured");
            (
                Stores::postgres(pool.clone()),
                Some(pool),
                Arc::new(gateway) as Arc<dyn PaymentGateway>,
            )
        };

    // Services
    let ledger = Arc::new(TransactionLedger::new(
        stores.transactions.clone(),
        config.payments.max_transaction_cents,
    ));
    let merchant_resolver = Arc::new(MerchantResolver::new(stores.merchants.clone()));
    let fulfillment = Arc::new(EntityStatusUpdater::new(
        stores.entities.clone(),
        stores.merchants.clone(),
    ));
    let orchestrator = Arc::new(PaymentOrchestrator::new(
        gateway,
        ledger.clone(),
        merchant_resolver.clone(),
        stores.payment_methods.clone(),
        fulfillment.clone(),
        OrchestratorConfig::from_app_config(&config),
    ));
    let fee_calculator = Arc::new(FeeCalculator::new(
        merchant_resolver,
        config.payments.max_transaction_cents,
    ));
    let webhook_processor = Arc::new(WebhookProcessor::new(
        stores.webhooks.clone(),
        ledger,
        stores.merchants.clone(),
        stores.payment_methods.clone(),
        fulfillment,
        WebhookAuth {
            bearer_token: config.webhooks.bearer_token.clone(),
            signing_key: config.webhooks.signing_key.clone(),
        },
        config.webhooks.max_retries,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start webhook retry worker
    let retry_handle = if config.webhooks.retry_enabled {
        let worker = WebhookRetryWorker::new(
            webhook_processor.clone(),
            config.webhooks.retry_interval_secs,
        );
        Some(tokio::spawn(worker.run(shutdown_rx.clone())))
    } else {
        info!("Webhook retry worker disabled");
        None
    };

    let health_routes = Router::new()
        .route("/health", get(health))
        .with_state(HealthChecker::new(db_pool));

    let app = Router::new()
        .route("/", get(root))
        .merge(health_routes)
        .merge(api::payment_routes(PaymentsState {
            orchestrator,
            fee_calculator,
        }))
        .merge(api::webhook_routes(WebhookState {
            processor: webhook_processor,
        }))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!(address = %addr, "Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(shutdown_tx))
        .await?;

    if let Some(handle) = retry_handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "Webhook retry worker ended abnormally");
        }
    }

    info!("Server shut down");
    Ok(())
}
