//! Play Store subscription verification and real-time developer notifications

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use plansync_shared::Platform;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use crate::config::PlayStoreConfig;
use crate::entitlement::{StoreEvent, StoreEventKind};
use crate::error::{BillingError, BillingResult};
use crate::http::{Rejection, StoreHttp};
use crate::token_cache::{AccessToken, AccessTokenCache};
use crate::webhooks::StoreNotification;

const PUBLISHER_SCOPE: &str = "https://www.googleapis.com/auth/androidpublisher";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME: Duration = Duration::hours(1);
const MAX_TOKEN_LEN: usize = 4096;

/// A subscription purchase the Play Store vouched for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPurchase {
    pub purchase_token: String,
    pub product_id: String,
    pub expires_at: OffsetDateTime,
    pub order_id: Option<String>,
    pub state: Option<String>,
    pub test_purchase: bool,
}

/// Purchase tokens are opaque but only ever use URL-safe characters
pub fn validate_purchase_token(token: &str) -> BillingResult<()> {
    let well_formed = !token.is_empty()
        && token.len() <= MAX_TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if well_formed {
        Ok(())
    } else {
        Err(BillingError::ReceiptInvalid(
            "malformed purchase token".to_string(),
        ))
    }
}

// =============================================================================
// Wire formats
// =============================================================================

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionPurchaseV2 {
    #[serde(default)]
    subscription_state: Option<String>,
    #[serde(default)]
    latest_order_id: Option<String>,
    #[serde(default)]
    line_items: Vec<LineItem>,
    #[serde(default)]
    test_purchase: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineItem {
    product_id: String,
    #[serde(default)]
    expiry_time: Option<String>,
}

/// Pub/Sub push envelope
#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: PushMessage,
}

#[derive(Debug, Deserialize)]
struct PushMessage {
    /// Base64-encoded developer notification
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeveloperNotification {
    package_name: String,
    #[serde(default)]
    event_time_millis: Option<String>,
    #[serde(default)]
    subscription_notification: Option<SubscriptionNotification>,
    #[serde(default)]
    voided_purchase_notification: Option<VoidedPurchaseNotification>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionNotification {
    notification_type: i32,
    purchase_token: String,
    subscription_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VoidedPurchaseNotification {
    purchase_token: String,
    /// 1 = subscription, 2 = one-time product
    #[serde(default)]
    product_type: Option<i32>,
}

/// Subscription notification types, by their RTDN code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEventType {
    Recovered,
    Renewed,
    Canceled,
    Purchased,
    Restarted,
    Revoked,
    Expired,
    Other(i32),
}

impl SubscriptionEventType {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Recovered,
            2 => Self::Renewed,
            3 => Self::Canceled,
            4 => Self::Purchased,
            7 => Self::Restarted,
            12 => Self::Revoked,
            13 => Self::Expired,
            other => Self::Other(other),
        }
    }
}

/// A decoded developer notification, before any store call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayNotification {
    Subscription {
        event: SubscriptionEventType,
        purchase_token: String,
        subscription_id: String,
    },
    Voided {
        purchase_token: String,
    },
    Ignored {
        reason: String,
    },
}

/// Parse a Pub/Sub push body into a typed notification
pub fn parse_push_body(body: &[u8], package_name: &str) -> BillingResult<(PlayNotification, Option<OffsetDateTime>)> {
    let envelope: PushEnvelope = serde_json::from_slice(body)
        .map_err(|e| BillingError::ReceiptInvalid(format!("malformed Pub/Sub envelope: {e}")))?;
    let decoded = STANDARD
        .decode(envelope.message.data.trim())
        .map_err(|e| BillingError::ReceiptInvalid(format!("notification data is not base64: {e}")))?;
    let notification: DeveloperNotification = serde_json::from_slice(&decoded)
        .map_err(|e| BillingError::ReceiptInvalid(format!("malformed developer notification: {e}")))?;

    if notification.package_name != package_name {
        return Err(BillingError::ReceiptInvalid(format!(
            "notification is for package {}",
            notification.package_name
        )));
    }

    let occurred_at = notification
        .event_time_millis
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok());

    let parsed = if let Some(sub) = notification.subscription_notification {
        PlayNotification::Subscription {
            event: SubscriptionEventType::from_code(sub.notification_type),
            purchase_token: sub.purchase_token,
            subscription_id: sub.subscription_id,
        }
    } else if let Some(voided) = notification.voided_purchase_notification {
        if voided.product_type == Some(2) {
            PlayNotification::Ignored {
                reason: "voided one-time product".to_string(),
            }
        } else {
            PlayNotification::Voided {
                purchase_token: voided.purchase_token,
            }
        }
    } else {
        PlayNotification::Ignored {
            reason: "not a subscription notification".to_string(),
        }
    };

    Ok((parsed, occurred_at))
}

// =============================================================================
// Client
// =============================================================================

/// Play Store verification client
#[derive(Debug, Clone)]
pub struct PlayStoreClient {
    config: PlayStoreConfig,
    http: StoreHttp,
    tokens: Arc<AccessTokenCache>,
}

impl PlayStoreClient {
    pub fn new(config: PlayStoreConfig, http: StoreHttp, tokens: Arc<AccessTokenCache>) -> Self {
        Self {
            config,
            http,
            tokens,
        }
    }

    /// Sign the service-account assertion
    fn assertion(&self, now: OffsetDateTime) -> BillingResult<String> {
        let account = &self.config.service_account;
        let claims = AssertionClaims {
            iss: &account.client_email,
            scope: PUBLISHER_SCOPE,
            aud: &account.token_uri,
            iat: now.unix_timestamp(),
            exp: (now + ASSERTION_LIFETIME).unix_timestamp(),
        };
        let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
            .map_err(|e| BillingError::AuthFailure(format!("unusable service account key: {e}")))?;
        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| BillingError::AuthFailure(format!("failed to sign assertion: {e}")))
    }

    async fn fetch_access_token(&self, now: OffsetDateTime) -> BillingResult<AccessToken> {
        let assertion = self.assertion(now)?;
        let token_uri = &self.config.service_account.token_uri;
        let response: TokenResponse = self
            .http
            .send_json("play_store_token", Rejection::Auth, |c| {
                c.post(token_uri)
                    .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            })
            .await?;

        info!(expires_in = response.expires_in, "Obtained Play Store access token");
        Ok(AccessToken {
            token: response.access_token,
            expires_at: now + Duration::seconds(response.expires_in),
        })
    }

    async fn access_token(&self, now: OffsetDateTime) -> BillingResult<String> {
        self.tokens
            .get_or_refresh(now, || self.fetch_access_token(now))
            .await
    }

    /// Query the subscription behind `purchase_token` and check that it is
    /// for `product_id`
    pub async fn verify_subscription(
        &self,
        product_id: &str,
        purchase_token: &str,
        now: OffsetDateTime,
    ) -> BillingResult<VerifiedPurchase> {
        validate_purchase_token(purchase_token)?;
        let bearer = self.access_token(now).await?;
        let url = format!(
            "{}/androidpublisher/v3/applications/{}/purchases/subscriptionsv2/tokens/{}",
            self.config.api_base_url.trim_end_matches('/'),
            self.config.package_name,
            purchase_token
        );

        let result: BillingResult<SubscriptionPurchaseV2> = self
            .http
            .send_json("play_store_subscription", Rejection::Receipt, |c| {
                c.get(&url).bearer_auth(&bearer)
            })
            .await;
        let purchase = match result {
            Ok(purchase) => purchase,
            Err(BillingError::AuthFailure(reason)) => {
                // The cached token was refused; make the next call fetch a new one
                self.tokens.invalidate().await;
                return Err(BillingError::AuthFailure(reason));
            }
            Err(e) => return Err(e),
        };

        let item = purchase
            .line_items
            .iter()
            .find(|item| item.product_id == product_id)
            .ok_or_else(|| {
                BillingError::ReceiptInvalid(format!(
                    "purchase is not for product {product_id}"
                ))
            })?;
        let expiry = item.expiry_time.as_deref().ok_or_else(|| {
            BillingError::ReceiptInvalid("subscription has no expiryTime".to_string())
        })?;
        let expires_at = OffsetDateTime::parse(expiry, &Rfc3339)
            .map_err(|e| BillingError::ReceiptInvalid(format!("invalid expiryTime {expiry}: {e}")))?;

        debug!(
            product_id,
            state = ?purchase.subscription_state,
            "Play Store subscription verified"
        );

        Ok(VerifiedPurchase {
            purchase_token: purchase_token.to_string(),
            product_id: item.product_id.clone(),
            expires_at,
            order_id: purchase.latest_order_id,
            state: purchase.subscription_state,
            test_purchase: purchase.test_purchase.is_some(),
        })
    }

    /// Decode a push body and map it to a store event.
    ///
    /// Renewal-type notifications carry no expiry, so the new period end is
    /// always read back from the subscription endpoint.
    pub async fn decode_notification(
        &self,
        body: &[u8],
        received_at: OffsetDateTime,
    ) -> BillingResult<StoreNotification> {
        let (notification, occurred_at) = parse_push_body(body, &self.config.package_name)?;
        let occurred_at = occurred_at.unwrap_or(received_at);

        let (purchase_token, kind) = match notification {
            PlayNotification::Ignored { reason } => return Ok(StoreNotification::Ignored { reason }),
            PlayNotification::Voided { purchase_token } => {
                (purchase_token, StoreEventKind::Cancelled { revoked: true })
            }
            PlayNotification::Subscription {
                event,
                purchase_token,
                subscription_id,
            } => {
                let kind = match event {
                    SubscriptionEventType::Recovered
                    | SubscriptionEventType::Renewed
                    | SubscriptionEventType::Purchased
                    | SubscriptionEventType::Restarted => {
                        let purchase = self
                            .verify_subscription(&subscription_id, &purchase_token, received_at)
                            .await?;
                        StoreEventKind::Renewed {
                            expires_at: purchase.expires_at,
                            product_id: Some(purchase.product_id),
                        }
                    }
                    SubscriptionEventType::Canceled => StoreEventKind::Cancelled { revoked: false },
                    SubscriptionEventType::Revoked => StoreEventKind::Cancelled { revoked: true },
                    SubscriptionEventType::Expired => StoreEventKind::Expired,
                    SubscriptionEventType::Other(code) => {
                        return Ok(StoreNotification::Ignored {
                            reason: format!("unhandled subscription notification type {code}"),
                        })
                    }
                };
                (purchase_token, kind)
            }
        };

        Ok(StoreNotification::Event(StoreEvent {
            platform: Platform::PlayStore,
            external_id: purchase_token,
            kind,
            occurred_at,
        }))
    }
}
