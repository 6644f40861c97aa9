//! Outbound HTTP to the stores, with bounded timeouts and retries

use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{BillingError, BillingResult};

/// Result of a single attempt
#[derive(Debug)]
enum Attempt {
    /// Timeout, connection failure, 5xx or 429
    Transient(String),
    Permanent(BillingError),
}

impl Attempt {
    fn is_transient(&self) -> bool {
        matches!(self, Attempt::Transient(_))
    }
}

/// How a non-retryable 4xx from an endpoint is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The submitted receipt or token was refused
    Receipt,
    /// Our credentials were refused
    Auth,
    /// The endpoint itself is misbehaving
    Unavailable,
}

impl Rejection {
    fn into_error(self, message: String) -> BillingError {
        match self {
            Rejection::Receipt => BillingError::ReceiptInvalid(message),
            Rejection::Auth => BillingError::AuthFailure(message),
            Rejection::Unavailable => BillingError::ServiceUnavailable(message),
        }
    }
}

/// HTTP client shared by both store integrations
#[derive(Debug, Clone)]
pub struct StoreHttp {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl StoreHttp {
    pub fn new(policy: RetryPolicy) -> BillingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(policy.request_timeout)
            .connect_timeout(policy.request_timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, policy })
    }

    fn strategy(&self) -> impl Iterator<Item = Duration> {
        // 2^n * (base / 2) gives base, 2*base, 4*base...
        let half_base = (self.policy.base_delay.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(half_base)
            .max_delay(self.policy.max_delay)
            .map(jitter)
            .take(self.policy.max_attempts.saturating_sub(1))
    }

    /// Send the request built by `build`, retrying transient failures, and
    /// decode a JSON body.
    ///
    /// 401/403 always map to `AuthFailure`; other 4xx map through `rejection`.
    pub async fn send_json<T, F>(
        &self,
        endpoint: &'static str,
        rejection: Rejection,
        build: F,
    ) -> BillingResult<T>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let client = &self.client;
        let build = &build;
        let max_attempts = self.policy.max_attempts;

        let result = RetryIf::spawn(
            self.strategy(),
            || async move { attempt::<T>(endpoint, rejection, build(client)).await },
            |e: &Attempt| {
                if let Attempt::Transient(reason) = e {
                    warn!(endpoint, reason = %reason, "Transient store failure - will retry");
                }
                e.is_transient()
            },
        )
        .await;

        match result {
            Ok(value) => Ok(value),
            Err(Attempt::Permanent(err)) => Err(err),
            Err(Attempt::Transient(reason)) => Err(BillingError::ServiceUnavailable(format!(
                "{endpoint}: {reason} (after {max_attempts} attempts)"
            ))),
        }
    }
}

async fn attempt<T: DeserializeOwned>(
    endpoint: &'static str,
    rejection: Rejection,
    request: RequestBuilder,
) -> Result<T, Attempt> {
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
            return Err(Attempt::Transient(e.to_string()))
        }
        Err(e) => return Err(Attempt::Permanent(BillingError::Internal(e.to_string()))),
    };

    let status = response.status();
    if status.is_success() {
        return response.json::<T>().await.map_err(|e| {
            if e.is_decode() {
                Attempt::Permanent(BillingError::ServiceUnavailable(format!(
                    "{endpoint}: malformed response body: {e}"
                )))
            } else {
                Attempt::Transient(e.to_string())
            }
        });
    }

    debug!(endpoint, status = status.as_u16(), "Store returned error status");
    Err(classify_status(endpoint, status, rejection))
}

fn classify_status(endpoint: &str, status: StatusCode, rejection: Rejection) -> Attempt {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Attempt::Transient(format!("HTTP {status}"))
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Attempt::Permanent(BillingError::AuthFailure(format!("{endpoint}: HTTP {status}")))
    } else {
        Attempt::Permanent(rejection.into_error(format!("{endpoint}: HTTP {status}")))
    }
}
