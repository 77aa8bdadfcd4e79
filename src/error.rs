//! Application-wide error type
//!
//! Every failure surfaced over HTTP goes through [`AppError`], which carries
//! the HTTP status mapping, a stable machine-readable code, a user-facing
//! message and the retry hint the bill-pay UI uses to choose between
//! "try again" and "contact support".

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for programmatic handling by clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "DUPLICATE_IN_FLIGHT")]
    DuplicateInFlight,
    #[serde(rename = "PAYMENT_DECLINED")]
    PaymentDeclined,
    #[serde(rename = "TRANSACTION_NOT_FOUND")]
    TransactionNotFound,
    #[serde(rename = "MERCHANT_NOT_FOUND")]
    MerchantNotFound,
    #[serde(rename = "MERCHANT_NOT_CONFIGURED")]
    MerchantNotConfigured,
    #[serde(rename = "PAYMENT_INSTRUMENT_NOT_FOUND")]
    PaymentInstrumentNotFound,
    #[serde(rename = "INVALID_REFUND")]
    InvalidRefund,
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors (502, 503, 504)
    #[serde(rename = "PAYMENT_PROCESSOR_ERROR")]
    PaymentProcessorError,
    #[serde(rename = "EXTERNAL_SERVICE_TIMEOUT")]
    ExternalServiceTimeout,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Business-rule failures
#[derive(Debug, Clone)]
pub enum DomainError {
    /// The same operation key is already being processed
    DuplicateInFlight { operation_key: String },
    /// The processor declined the charge
    PaymentDeclined { reason: String },
    /// Ledger row doesn't exist
    TransactionNotFound { transaction_id: String },
    /// Merchant doesn't exist
    MerchantNotFound { merchant_id: String },
    /// Merchant onboarding is incomplete
    MerchantNotConfigured { merchant_id: String, reason: String },
    /// Stored instrument missing, disabled or owned by someone else
    PaymentInstrumentNotFound { instrument_id: String },
    /// Refund request not allowed for this transaction
    InvalidRefund { transaction_id: String, reason: String },
    /// Caller failed webhook or API authentication
    Unauthorized { reason: String },
}

/// Infrastructure-level errors (database, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    /// Database connection or query failure
    Database { message: String, is_retryable: bool },
    /// Missing or invalid configuration
    Configuration { message: String },
}

/// External service errors
#[derive(Debug, Clone)]
pub enum ExternalError {
    /// Payment processor (Finix) error
    PaymentProcessor {
        processor: String,
        message: String,
        is_retryable: bool,
    },
    /// External service timeout
    Timeout { service: String, timeout_secs: u64 },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    /// Required field missing
    MissingField { field: String },
    /// Field present but unusable
    InvalidField { field: String, reason: String },
    /// Amount is zero, negative, or above the ceiling
    InvalidAmount { amount: i64, reason: String },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::DuplicateInFlight { .. } => 409,
                DomainError::PaymentDeclined { .. } => 402,
                DomainError::TransactionNotFound { .. } => 404,
                DomainError::MerchantNotFound { .. } => 404,
                DomainError::MerchantNotConfigured { .. } => 422,
                DomainError::PaymentInstrumentNotFound { .. } => 404,
                DomainError::InvalidRefund { .. } => 422,
                DomainError::Unauthorized { .. } => 401,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProcessor { .. } => 502,
                ExternalError::Timeout { .. } => 504,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::DuplicateInFlight { .. } => ErrorCode::DuplicateInFlight,
                DomainError::PaymentDeclined { .. } => ErrorCode::PaymentDeclined,
                DomainError::TransactionNotFound { .. } => ErrorCode::TransactionNotFound,
                DomainError::MerchantNotFound { .. } => ErrorCode::MerchantNotFound,
                DomainError::MerchantNotConfigured { .. } => ErrorCode::MerchantNotConfigured,
                DomainError::PaymentInstrumentNotFound { .. } => {
                    ErrorCode::PaymentInstrumentNotFound
                }
                DomainError::InvalidRefund { .. } => ErrorCode::InvalidRefund,
                DomainError::Unauthorized { .. } => ErrorCode::Unauthorized,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProcessor { .. } => ErrorCode::PaymentProcessorError,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::DuplicateInFlight { .. } => {
                    "This payment is already being processed. Please wait and check its status"
                        .to_string()
                }
                DomainError::PaymentDeclined { reason } => {
                    format!("Payment was declined: {}", reason)
                }
                DomainError::TransactionNotFound { transaction_id } => {
                    format!("Transaction '{}' not found", transaction_id)
                }
                DomainError::MerchantNotFound { merchant_id } => {
                    format!("Merchant '{}' not found", merchant_id)
                }
                DomainError::MerchantNotConfigured { .. } => {
                    "This merchant is not set up to accept payments yet. Please contact support"
                        .to_string()
                }
                DomainError::PaymentInstrumentNotFound { .. } => {
                    "Payment method not found or disabled".to_string()
                }
                DomainError::InvalidRefund { reason, .. } => {
                    format!("Refund not allowed: {}", reason)
                }
                DomainError::Unauthorized { .. } => "Unauthorized".to_string(),
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProcessor {
                    processor,
                    is_retryable,
                    ..
                } => {
                    if *is_retryable {
                        format!(
                            "Payment processor ({}) is temporarily unavailable. Please try again",
                            processor
                        )
                    } else {
                        "Payment processing failed. Please contact support".to_string()
                    }
                }
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => {
                    format!(
                        "{} request timed out after {} seconds. Please check the payment status before retrying",
                        service, timeout_secs
                    )
                }
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
                ValidationError::InvalidField { field, reason } => {
                    format!("Invalid value for '{}': {}", field, reason)
                }
                ValidationError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProcessor { is_retryable, .. } => *is_retryable,
                // The transfer may have landed processor-side.
                ExternalError::Timeout { .. } => false,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

// From<DatabaseError>, From<PaymentError> and From<OrchestratorError> live next to those types.

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_in_flight_error() {
        let error = AppError::new(AppErrorKind::Domain(DomainError::DuplicateInFlight {
            operation_key: "op_123".to_string(),
        }));

        assert_eq!(error.status_code(), 409);
        assert_eq!(error.error_code(), ErrorCode::DuplicateInFlight);
        assert!(error.user_message().contains("already being processed"));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_processor_error_retry_flag() {
        let transient = AppError::new(AppErrorKind::External(ExternalError::PaymentProcessor {
            processor: "finix".to_string(),
            message: "503".to_string(),
            is_retryable: true,
        }));
        assert_eq!(transient.status_code(), 502);
        assert!(transient.is_retryable());
        assert!(transient.user_message().contains("try again"));

        let timeout = AppError::new(AppErrorKind::External(ExternalError::Timeout {
            service: "Finix".to_string(),
            timeout_secs: 30,
        }));
        assert_eq!(timeout.status_code(), 504);
        assert!(!timeout.is_retryable());
    }

    #[test]
    fn test_validation_error() {
        let error = AppError::new(AppErrorKind::Validation(ValidationError::InvalidAmount {
            amount: -100,
            reason: "Amount must be positive".to_string(),
        }));

        assert_eq!(error.status_code(), 400);
        assert_eq!(error.error_code(), ErrorCode::ValidationError);
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_error_code_serializes_screaming() {
        let json = serde_json::to_value(ErrorCode::MerchantNotConfigured).unwrap();
        assert_eq!(json, "MERCHANT_NOT_CONFIGURED");
    }
}
