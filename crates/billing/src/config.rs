//! Store integration and lifecycle configuration

use std::time::Duration;

use serde::Deserialize;

use crate::error::{BillingError, BillingResult};

const DEFAULT_VERIFY_URL: &str = "https://buy.itunes.apple.com/verifyReceipt";
const DEFAULT_SANDBOX_VERIFY_URL: &str = "https://sandbox.itunes.apple.com/verifyReceipt";
const DEFAULT_JWKS_URL: &str = "https://appleid.apple.com/auth/keys";
const DEFAULT_ISSUER: &str = "https://appleid.apple.com";
const DEFAULT_PLAY_API_BASE_URL: &str = "https://androidpublisher.googleapis.com";

/// Configuration for App Store receipt and notification verification
#[derive(Clone)]
pub struct AppStoreConfig {
    /// Bundle identifier every verified payload must carry
    pub bundle_id: String,
    /// Shared secret for legacy receipt verification
    pub shared_secret: String,
    /// Production legacy verification endpoint
    pub verify_url: String,
    /// Sandbox legacy verification endpoint
    pub sandbox_verify_url: String,
    /// Public key set used to verify signed payloads
    pub jwks_url: String,
    /// Required `iss` claim of signed payloads
    pub issuer: String,
}

impl std::fmt::Debug for AppStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppStoreConfig")
            .field("bundle_id", &self.bundle_id)
            .field("shared_secret", &"<redacted>")
            .field("verify_url", &self.verify_url)
            .field("sandbox_verify_url", &self.sandbox_verify_url)
            .field("jwks_url", &self.jwks_url)
            .field("issuer", &self.issuer)
            .finish()
    }
}

impl AppStoreConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            bundle_id: required("APP_STORE_BUNDLE_ID")?,
            shared_secret: required("APP_STORE_SHARED_SECRET")?,
            verify_url: optional("APP_STORE_VERIFY_URL", DEFAULT_VERIFY_URL),
            sandbox_verify_url: optional("APP_STORE_SANDBOX_VERIFY_URL", DEFAULT_SANDBOX_VERIFY_URL),
            jwks_url: optional("APP_STORE_JWKS_URL", DEFAULT_JWKS_URL),
            issuer: optional("APP_STORE_ISSUER", DEFAULT_ISSUER),
        })
    }
}

/// Google service-account key file, as downloaded from the console
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    pub token_uri: String,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

impl ServiceAccountKey {
    /// Parse the JSON key file contents
    pub fn from_json(raw: &str) -> BillingResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| BillingError::Config(format!("invalid service account JSON: {e}")))
    }
}

/// Configuration for Play Store subscription verification
#[derive(Debug, Clone)]
pub struct PlayStoreConfig {
    pub package_name: String,
    pub service_account: ServiceAccountKey,
    /// Base URL of the Android Publisher API
    pub api_base_url: String,
}

impl PlayStoreConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            package_name: required("PLAY_STORE_PACKAGE_NAME")?,
            service_account: ServiceAccountKey::from_json(&required(
                "PLAY_STORE_SERVICE_ACCOUNT_JSON",
            )?)?,
            api_base_url: optional("PLAY_STORE_API_BASE_URL", DEFAULT_PLAY_API_BASE_URL),
        })
    }
}

/// Outbound call policy shared by both stores
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: usize,
    /// First backoff delay; doubles on every retry
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> BillingResult<Self> {
        let timeout_secs: u64 = parse_or("PLATFORM_REQUEST_TIMEOUT_SECS", 15)?;
        let base_ms: u64 = parse_or("PLATFORM_RETRY_BASE_MS", 100)?;

        Ok(Self {
            base_delay: Duration::from_millis(base_ms),
            request_timeout: Duration::from_secs(timeout_secs.clamp(10, 30)),
            ..Self::default()
        })
    }
}

/// Grace window and warning cadence
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub grace_period: time::Duration,
    /// Days before expiry at which a warning is sent, largest first
    pub warning_days: Vec<u32>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            grace_period: time::Duration::days(3),
            warning_days: vec![7, 3, 1],
        }
    }
}

impl LifecycleConfig {
    pub fn from_env() -> BillingResult<Self> {
        let grace_days: i64 = parse_or("GRACE_PERIOD_DAYS", 3)?;
        if grace_days < 0 {
            return Err(BillingError::Config(
                "GRACE_PERIOD_DAYS must not be negative".to_string(),
            ));
        }

        let warning_days = match std::env::var("EXPIRY_WARNING_DAYS") {
            Ok(raw) => parse_warning_days(&raw)?,
            Err(_) => vec![7, 3, 1],
        };

        Ok(Self {
            grace_period: time::Duration::days(grace_days),
            warning_days,
        })
    }
}

fn parse_warning_days(raw: &str) -> BillingResult<Vec<u32>> {
    let mut days = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>().map_err(|_| {
                BillingError::Config(format!("EXPIRY_WARNING_DAYS has invalid entry: {s}"))
            })
        })
        .collect::<BillingResult<Vec<_>>>()?;
    days.sort_unstable_by(|a, b| b.cmp(a));
    days.dedup();
    Ok(days)
}

/// Complete configuration for the entitlement subsystem
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub app_store: AppStoreConfig,
    pub play_store: PlayStoreConfig,
    pub retry: RetryPolicy,
    pub lifecycle: LifecycleConfig,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            app_store: AppStoreConfig::from_env()?,
            play_store: PlayStoreConfig::from_env()?,
            retry: RetryPolicy::from_env()?,
            lifecycle: LifecycleConfig::from_env()?,
        })
    }
}

fn required(name: &str) -> BillingResult<String> {
    std::env::var(name).map_err(|_| BillingError::Config(format!("{name} not set")))
}

fn optional(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> BillingResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{name} is not a valid number: {raw}"))),
        Err(_) => Ok(default),
    }
}
