//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use std::env;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub finix: FinixConfig,
    pub payments: PaymentsConfig,
    pub webhooks: WebhookConfig,
    pub skip_externals: bool,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Finix processor credentials and transport settings
#[derive(Debug, Clone)]
pub struct FinixConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub api_version: String,
    pub timeout_secs: u64,
}

/// Charge-time policy
#[derive(Debug, Clone)]
pub struct PaymentsConfig {
    pub currency: String,
    /// Per-transaction ceiling in minor units; totals above it are rejected before charging.
    pub max_transaction_cents: i64,
}

/// Inbound webhook settings
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub bearer_token: String,
    pub signing_key: Option<String>,
    pub retry_enabled: bool,
    pub retry_interval_secs: u64,
    pub max_retries: i32,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        let skip_externals = env::var("SKIP_EXTERNALS")
            .unwrap_or_else(|_| "false".to_string())
            .to_lowercase()
            == "true";

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database: DatabaseConfig::from_env(skip_externals)?,
            logging: LoggingConfig::from_env(),
            finix: FinixConfig::from_env(skip_externals)?,
            payments: PaymentsConfig::from_env()?,
            webhooks: WebhookConfig::from_env(skip_externals)?,
            skip_externals,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.logging.validate()?;
        self.payments.validate()?;
        self.webhooks.validate()?;
        if !self.skip_externals {
            self.database.validate()?;
            self.finix.validate()?;
        }

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env(skip_externals: bool) -> Result<Self, ConfigError> {
        let url = match env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(_) if skip_externals => String::new(),
            Err(_) => return Err(ConfigError::MissingVariable("DATABASE_URL".to_string())),
        };

        Ok(DatabaseConfig {
            url,
            max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()))?,
            min_connections: env::var("DB_MIN_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MIN_CONNECTIONS".to_string()))?,
            connection_timeout: env::var("DB_CONNECTION_TIMEOUT")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_CONNECTION_TIMEOUT".to_string()))?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl FinixConfig {
    pub fn from_env(skip_externals: bool) -> Result<Self, ConfigError> {
        let required = |name: &str| -> Result<String, ConfigError> {
            match env::var(name) {
                Ok(value) => Ok(value),
                Err(_) if skip_externals => Ok(String::new()),
                Err(_) => Err(ConfigError::MissingVariable(name.to_string())),
            }
        };

        Ok(FinixConfig {
            base_url: env::var("FINIX_BASE_URL")
                .unwrap_or_else(|_| "https://finix.sandbox-payments-api.com".to_string()),
            username: required("FINIX_USERNAME")?,
            password: required("FINIX_PASSWORD")?,
            api_version: env::var("FINIX_API_VERSION")
                .unwrap_or_else(|_| "2022-02-01".to_string()),
            timeout_secs: env::var("FINIX_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("FINIX_TIMEOUT_SECS".to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "FINIX_BASE_URL must be a valid URL".to_string(),
            ));
        }

        if self.username.is_empty() || self.password.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "FINIX_USERNAME and FINIX_PASSWORD are required".to_string(),
            ));
        }

        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue("FINIX_TIMEOUT_SECS".to_string()));
        }

        Ok(())
    }
}

impl PaymentsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(PaymentsConfig {
            currency: env::var("PAYMENT_CURRENCY").unwrap_or_else(|_| "USD".to_string()),
            max_transaction_cents: env::var("MAX_TRANSACTION_CENTS")
                .unwrap_or_else(|_| "10000000".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("MAX_TRANSACTION_CENTS".to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.currency.len() != 3 {
            return Err(ConfigError::InvalidValue("PAYMENT_CURRENCY".to_string()));
        }

        if self.max_transaction_cents <= 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_TRANSACTION_CENTS".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            max_transaction_cents: 10_000_000,
        }
    }
}

impl WebhookConfig {
    pub fn from_env(skip_externals: bool) -> Result<Self, ConfigError> {
        let bearer_token = match env::var("FINIX_WEBHOOK_TOKEN") {
            Ok(token) => token,
            Err(_) if skip_externals => String::new(),
            Err(_) => {
                return Err(ConfigError::MissingVariable(
                    "FINIX_WEBHOOK_TOKEN".to_string(),
                ))
            }
        };

        Ok(WebhookConfig {
            bearer_token,
            signing_key: env::var("FINIX_WEBHOOK_SIGNING_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            retry_enabled: env::var("WEBHOOK_RETRY_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .to_lowercase()
                != "false",
            retry_interval_secs: env::var("WEBHOOK_RETRY_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("WEBHOOK_RETRY_INTERVAL_SECS".to_string()))?,
            max_retries: env::var("WEBHOOK_MAX_RETRIES")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("WEBHOOK_MAX_RETRIES".to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_enabled && self.retry_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "WEBHOOK_RETRY_INTERVAL_SECS".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
