//! Persistence: Postgres pool setup, repositories and the store traits the
//! payment core depends on.

pub mod entity_repository;
pub mod error;
pub mod memory;
pub mod merchant_repository;
pub mod payment_method_repository;
pub mod transaction_repository;
pub mod webhook_repository;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error as log_error, info, warn};

use self::entity_repository::{EntityStore, PgEntityStore};
use self::error::DatabaseError;
use self::memory::InMemoryStore;
use self::merchant_repository::{MerchantStore, PgMerchantStore};
use self::payment_method_repository::{PaymentMethodStore, PgPaymentMethodStore};
use self::transaction_repository::{PgTransactionStore, TransactionStore};
use self::webhook_repository::{PgWebhookStore, WebhookStore};
use crate::config::DatabaseConfig;

/// Database pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 5,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// Initialize the database connection pool
pub async fn init_pool(
    database_url: &str,
    config: Option<PoolConfig>,
) -> Result<PgPool, DatabaseError> {
    let config = config.unwrap_or_default();

    info!(
        "Initializing database pool: max_connections={}, min_connections={}, connection_timeout={:?}",
        config.max_connections, config.min_connections, config.connection_timeout
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connection_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .connect(database_url)
        .await
        .map_err(|e| {
            log_error!("Failed to initialize database pool: {}", e);
            DatabaseError::from_sqlx(e)
        })?;

    // Test the connection
    pool.acquire().await.map_err(|e| {
        log_error!("Failed to acquire test connection: {}", e);
        DatabaseError::from_sqlx(e)
    })?;

    info!("Database pool initialized successfully");
    Ok(pool)
}

/// Connection pool health check
pub async fn health_check(pool: &PgPool) -> Result<(), DatabaseError> {
    let _result = sqlx::query("SELECT 1").fetch_one(pool).await.map_err(|e| {
        warn!("Health check failed: {}", e);
        DatabaseError::from_sqlx(e)
    })?;

    Ok(())
}

/// Get pool statistics
pub struct PoolStats {
    pub num_idle: u32,
    pub size: u32,
}

pub fn get_pool_stats(pool: &PgPool) -> PoolStats {
    PoolStats {
        num_idle: pool.num_idle() as u32,
        size: pool.size(),
    }
}

/// Initialize the database pool from application configuration
pub async fn init_pool_from_config(config: &DatabaseConfig) -> Result<PgPool, DatabaseError> {
    let pool_config = PoolConfig {
        max_connections: config.max_connections,
        min_connections: config.min_connections,
        connection_timeout: Duration::from_secs(config.connection_timeout),
        idle_timeout: Duration::from_secs(config.idle_timeout.unwrap_or(600)),
        max_lifetime: Duration::from_secs(1800),
    };

    init_pool(&config.url, Some(pool_config)).await
}

/// Every store the payment core talks to, behind its trait.
#[derive(Clone)]
pub struct Stores {
    pub transactions: Arc<dyn TransactionStore>,
    pub merchants: Arc<dyn MerchantStore>,
    pub payment_methods: Arc<dyn PaymentMethodStore>,
    pub entities: Arc<dyn EntityStore>,
    pub webhooks: Arc<dyn WebhookStore>,
}

impl Stores {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            transactions: Arc::new(PgTransactionStore::new(pool.clone())),
            merchants: Arc::new(PgMerchantStore::new(pool.clone())),
            payment_methods: Arc::new(PgPaymentMethodStore::new(pool.clone())),
            entities: Arc::new(PgEntityStore::new(pool.clone())),
            webhooks: Arc::new(PgWebhookStore::new(pool)),
        }
    }

    pub fn in_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            transactions: store.clone(),
            merchants: store.clone(),
            payment_methods: store.clone(),
            entities: store.clone(),
            webhooks: store,
        }
    }
}
