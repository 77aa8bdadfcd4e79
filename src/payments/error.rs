use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    /// Business-logic decline; a failed transfer object may exist processor-side
    /// but no money moved.
    #[error("Payment declined: {message}")]
    PaymentDeclinedError {
        message: String,
        failure_code: Option<String>,
        transfer_id: Option<String>,
    },

    /// `request_sent == false` means the processor never saw the request.
    #[error("Network error: {message}")]
    NetworkError { message: String, request_sent: bool },

    /// No answer within the deadline; the processor may still have acted.
    #[error("Request timed out after {timeout_secs}s: {message}")]
    TimeoutError { message: String, timeout_secs: u64 },

    #[error("Rate limit exceeded: {message}")]
    RateLimitError {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("Webhook verification failed: {message}")]
    WebhookVerificationError { message: String },

    #[error("Provider error: provider={provider}, message={message}")]
    ProviderError {
        provider: String,
        message: String,
        status_code: Option<u16>,
        retryable: bool,
    },

    /// The processor received the request but the answer does not say what it
    /// did. `resource_id` is whatever id the response still carried.
    #[error("Ambiguous provider response: provider={provider}, message={message}")]
    AmbiguousResponse {
        provider: String,
        message: String,
        status_code: Option<u16>,
        resource_id: Option<String>,
    },
}

impl PaymentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } => false,
            PaymentError::PaymentDeclinedError { .. } => false,
            PaymentError::NetworkError { .. } => true,
            PaymentError::TimeoutError { .. } => false,
            PaymentError::RateLimitError { .. } => true,
            PaymentError::WebhookVerificationError { .. } => false,
            PaymentError::ProviderError { retryable, .. } => *retryable,
            PaymentError::AmbiguousResponse { .. } => false,
        }
    }

    /// True when the processor may have executed the request even though we
    /// did not get an answer. Callers must not assume money did not move.
    pub fn outcome_unknown(&self) -> bool {
        match self {
            PaymentError::TimeoutError { .. } => true,
            PaymentError::AmbiguousResponse { .. } => true,
            PaymentError::NetworkError { request_sent, .. } => *request_sent,
            _ => false,
        }
    }

    /// Processor-side id named by an otherwise unusable response.
    pub fn resource_id(&self) -> Option<&str> {
        match self {
            PaymentError::AmbiguousResponse { resource_id, .. } => resource_id.as_deref(),
            _ => None,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ValidationError { message, .. } => message.clone(),
            PaymentError::PaymentDeclinedError { message, .. } => {
                format!("Payment was declined: {}", message)
            }
            PaymentError::NetworkError { .. } => {
                "Payment processor is temporarily unavailable".to_string()
            }
            PaymentError::TimeoutError { .. } => {
                "Payment processor did not respond in time".to_string()
            }
            PaymentError::RateLimitError { .. } => {
                "Too many requests to payment processor. Please retry shortly".to_string()
            }
            PaymentError::WebhookVerificationError { .. } => {
                "Invalid webhook signature".to_string()
            }
            PaymentError::ProviderError { .. } => {
                "Payment processor returned an error".to_string()
            }
            PaymentError::AmbiguousResponse { .. } => {
                "Payment processor response could not be confirmed".to_string()
            }
        }
    }
}

impl From<PaymentError> for crate::error::AppError {
    fn from(err: PaymentError) -> Self {
        use crate::error::{AppError, AppErrorKind, DomainError, ExternalError, ValidationError};

        let kind = match &err {
            PaymentError::ValidationError { message, field } => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field: field.clone().unwrap_or_else(|| "request".to_string()),
                    reason: message.clone(),
                })
            }
            PaymentError::PaymentDeclinedError { message, .. } => {
                AppErrorKind::Domain(DomainError::PaymentDeclined {
                    reason: message.clone(),
                })
            }
            PaymentError::WebhookVerificationError { message } => {
                AppErrorKind::Domain(DomainError::Unauthorized {
                    reason: message.clone(),
                })
            }
            PaymentError::TimeoutError { timeout_secs, .. } => {
                AppErrorKind::External(ExternalError::Timeout {
                    service: "Finix".to_string(),
                    timeout_secs: *timeout_secs,
                })
            }
            _ => AppErrorKind::External(ExternalError::PaymentProcessor {
                processor: "finix".to_string(),
                message: err.to_string(),
                is_retryable: err.is_retryable(),
            }),
        };
        AppError::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_flags_are_set() {
        assert!(PaymentError::NetworkError {
            message: "connection refused".to_string(),
            request_sent: false,
        }
        .is_retryable());
        assert!(!PaymentError::PaymentDeclinedError {
            message: "declined".to_string(),
            failure_code: Some("CARD_DECLINED".to_string()),
            transfer_id: None,
        }
        .is_retryable());
    }

    #[test]
    fn outcome_unknown_only_for_ambiguous_failures() {
        let timeout = PaymentError::TimeoutError {
            message: "no response".to_string(),
            timeout_secs: 30,
        };
        assert!(timeout.outcome_unknown());
        assert!(!timeout.is_retryable());
        assert!(!PaymentError::NetworkError {
            message: "refused".to_string(),
            request_sent: false,
        }
        .outcome_unknown());
        assert!(!PaymentError::ProviderError {
            provider: "finix".to_string(),
            message: "HTTP 503".to_string(),
            status_code: Some(503),
            retryable: true,
        }
        .outcome_unknown());
    }

    #[test]
    fn ambiguous_response_is_unknown_and_final() {
        let err = PaymentError::AmbiguousResponse {
            provider: "finix".to_string(),
            message: "HTTP 504".to_string(),
            status_code: Some(504),
            resource_id: Some("TRabc".to_string()),
        };
        assert!(err.outcome_unknown());
        assert!(!err.is_retryable());
        assert_eq!(err.resource_id(), Some("TRabc"));
    }
}
