use crate::payments::error::{PaymentError, PaymentResult};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::warn;

/// HTTP basic credentials for the processor API.
#[derive(Clone)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Thin JSON client for processor calls.
///
/// Requests are sent exactly once. A transfer that times out may already have
/// been executed, so retrying is the caller's decision, never this client's.
#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    timeout: Duration,
    provider: &'static str,
}

impl PaymentHttpClient {
    pub fn new(provider: &'static str, timeout: Duration) -> PaymentResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentError::ProviderError {
                provider: provider.to_string(),
                message: format!("failed to initialize HTTP client: {}", e),
                status_code: None,
                retryable: false,
            })?;

        Ok(Self {
            client,
            timeout,
            provider,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        credentials: Option<&BasicCredentials>,
        body: Option<&JsonValue>,
        additional_headers: &[(&str, &str)],
    ) -> PaymentResult<T> {
        let mut request = self.client.request(method, url).timeout(self.timeout);

        if let Some(creds) = credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        for (k, v) in additional_headers {
            request = request.header(*k, *v);
        }
        if let Some(payload) = body {
            request = request.json(payload);
        }

        let resp = request.send().await.map_err(|e| self.classify_send_error(e))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| self.classify_send_error(e))?;

        if status.is_success() {
            // The request was accepted, so an unreadable body leaves the
            // outcome open rather than failed.
            return serde_json::from_str::<T>(&text).map_err(|e| PaymentError::AmbiguousResponse {
                provider: self.provider.to_string(),
                message: format!("invalid provider JSON response: {}", e),
                status_code: Some(status.as_u16()),
                resource_id: extract_resource_id(&text),
            });
        }

        Err(self.classify_status(status, &text))
    }

    fn classify_send_error(&self, err: reqwest::Error) -> PaymentError {
        if err.is_timeout() {
            return PaymentError::TimeoutError {
                message: format!("{} request timed out: {}", self.provider, err),
                timeout_secs: self.timeout.as_secs(),
            };
        }
        // A refused connection means the request never left this host.
        let request_sent = !err.is_connect() && !err.is_builder();
        PaymentError::NetworkError {
            message: format!("{} request failed: {}", self.provider, err),
            request_sent,
        }
    }

    fn classify_status(&self, status: StatusCode, body: &str) -> PaymentError {
        let message = extract_error_message(body).unwrap_or_else(|| format!("HTTP {}", status));

        match status.as_u16() {
            402 => PaymentError::PaymentDeclinedError {
                message,
                failure_code: extract_failure_code(body),
                transfer_id: None,
            },
            429 => PaymentError::RateLimitError {
                message,
                retry_after_seconds: None,
            },
            400 | 422 => PaymentError::ValidationError {
                message,
                field: None,
            },
            // The request reached the processor and may have been executed
            500 | 502 | 504 => {
                warn!(provider = self.provider, status = status.as_u16(), "provider outcome unknown");
                PaymentError::AmbiguousResponse {
                    provider: self.provider.to_string(),
                    message,
                    status_code: Some(status.as_u16()),
                    resource_id: extract_resource_id(body),
                }
            }
            code => {
                if status.is_server_error() {
                    warn!(provider = self.provider, status = code, "provider server error");
                }
                PaymentError::ProviderError {
                    provider: self.provider.to_string(),
                    message,
                    status_code: Some(code),
                    retryable: status.is_server_error(),
                }
            }
        }
    }
}

/// Finix error bodies look like `{"_embedded":{"errors":[{"code":..,"message":..}]}}`.
fn first_error(body: &str) -> Option<JsonValue> {
    let parsed: JsonValue = serde_json::from_str(body).ok()?;
    parsed
        .get("_embedded")
        .and_then(|e| e.get("errors"))
        .and_then(|errors| errors.as_array())
        .and_then(|errors| errors.first())
        .cloned()
}

/// Top-level `id` of a response body, if it parses as JSON at all.
pub fn extract_resource_id(body: &str) -> Option<String> {
    let parsed: JsonValue = serde_json::from_str(body).ok()?;
    parsed
        .get("id")
        .and_then(|id| id.as_str())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn extract_error_message(body: &str) -> Option<String> {
    first_error(body)
        .and_then(|e| e.get("message").and_then(|m| m.as_str()).map(str::to_string))
}

fn extract_failure_code(body: &str) -> Option<String> {
    first_error(body).and_then(|e| {
        e.get("failure_code")
            .or_else(|| e.get("code"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
    })
}

pub fn verify_hmac_sha256_hex(payload: &[u8], secret: &str, signature: &str) -> bool {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(v) => v,
        Err(_) => return false,
    };
    mac.update(payload);
    let computed = hex::encode(mac.finalize().into_bytes());
    let provided = signature.trim().trim_start_matches("sha256=").to_lowercase();
    secure_eq(computed.as_bytes(), provided.as_bytes())
}

pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
