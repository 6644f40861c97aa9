//! App Store receipt and notification verification
//!
//! Two receipt formats arrive from clients:
//! - signed transactions (compact JWS), verified against the published key set
//! - legacy base64 receipts, verified by posting them to `verifyReceipt`

use std::collections::HashSet;

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use plansync_shared::Platform;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::config::AppStoreConfig;
use crate::entitlement::{StoreEvent, StoreEventKind};
use crate::error::{BillingError, BillingResult};
use crate::http::{Rejection, StoreHttp};
use crate::webhooks::StoreNotification;

/// Legacy status: a sandbox receipt was sent to production
const STATUS_SANDBOX_RECEIPT: i64 = 21007;

/// A transaction the App Store vouched for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedTransaction {
    pub original_transaction_id: String,
    pub transaction_id: Option<String>,
    pub product_id: String,
    pub expires_at: OffsetDateTime,
    pub environment: Option<String>,
}

/// Whether the payload looks like a compact JWS rather than a legacy blob
pub fn is_signed_payload(receipt: &str) -> bool {
    let segments: Vec<&str> = receipt.trim().split('.').collect();
    segments.len() == 3
        && segments.iter().all(|s| {
            !s.is_empty()
                && s.bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}

fn from_millis(ms: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .map_err(|e| BillingError::ReceiptInvalid(format!("invalid timestamp {ms}: {e}")))
}

// =============================================================================
// Wire formats
// =============================================================================

/// Decoded signed transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransaction {
    pub original_transaction_id: String,
    #[serde(default)]
    pub transaction_id: Option<String>,
    pub product_id: String,
    pub bundle_id: String,
    /// Milliseconds since the epoch
    #[serde(default)]
    pub expires_date: Option<i64>,
    #[serde(default)]
    pub environment: Option<String>,
}

#[derive(Debug, Serialize)]
struct VerifyReceiptRequest<'a> {
    #[serde(rename = "receipt-data")]
    receipt_data: &'a str,
    password: &'a str,
    #[serde(rename = "exclude-old-transactions")]
    exclude_old_transactions: bool,
}

#[derive(Debug, Deserialize)]
struct VerifyReceiptResponse {
    status: i64,
    #[serde(default)]
    environment: Option<String>,
    #[serde(default)]
    receipt: Option<LegacyReceipt>,
    #[serde(default)]
    latest_receipt_info: Vec<LegacyTransaction>,
}

#[derive(Debug, Deserialize)]
struct LegacyReceipt {
    #[serde(default)]
    bundle_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LegacyTransaction {
    original_transaction_id: String,
    #[serde(default)]
    transaction_id: Option<String>,
    product_id: String,
    /// Milliseconds since the epoch, as a string
    #[serde(default)]
    expires_date_ms: Option<String>,
}

/// App Store Server Notifications V2 request body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationBody {
    signed_payload: String,
}

/// Notification types this system acts on; everything else is `Ignored`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    Subscribed,
    DidRenew,
    RenewalExtended,
    Refund,
    Revoke,
    Expired,
    GracePeriodExpired,
    #[serde(other)]
    Ignored,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationPayload {
    notification_type: NotificationType,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    signed_date: Option<i64>,
    #[serde(default)]
    data: Option<NotificationData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationData {
    #[serde(default)]
    bundle_id: Option<String>,
    #[serde(default)]
    signed_transaction_info: Option<String>,
}

fn latest_transaction(transactions: &[LegacyTransaction]) -> BillingResult<(LegacyTransaction, OffsetDateTime)> {
    transactions
        .iter()
        .filter_map(|t| {
            let ms = t.expires_date_ms.as_deref()?.parse::<i64>().ok()?;
            Some((t, ms))
        })
        .max_by_key(|(_, ms)| *ms)
        .map(|(t, ms)| from_millis(ms).map(|at| (t.clone(), at)))
        .unwrap_or_else(|| {
            Err(BillingError::ReceiptInvalid(
                "receipt has no subscription transactions".to_string(),
            ))
        })
}

fn check_legacy_status(status: i64) -> BillingResult<()> {
    match status {
        0 => Ok(()),
        21005 | 21100..=21199 => Err(BillingError::ServiceUnavailable(format!(
            "App Store verification unavailable (status {status})"
        ))),
        other => Err(BillingError::ReceiptInvalid(format!(
            "App Store rejected receipt (status {other})"
        ))),
    }
}

// =============================================================================
// Client
// =============================================================================

/// App Store verification client
#[derive(Debug, Clone)]
pub struct AppStoreClient {
    config: AppStoreConfig,
    http: StoreHttp,
}

impl AppStoreClient {
    pub fn new(config: AppStoreConfig, http: StoreHttp) -> Self {
        Self { config, http }
    }

    /// Verify a client-submitted receipt in either format
    pub async fn verify_receipt(&self, receipt: &str) -> BillingResult<VerifiedTransaction> {
        if is_signed_payload(receipt) {
            self.verify_signed_transaction(receipt.trim()).await
        } else {
            self.verify_legacy_receipt(receipt).await
        }
    }

    /// Fetch the current public key set. Not cached across calls.
    async fn fetch_keys(&self) -> BillingResult<JwkSet> {
        let url = &self.config.jwks_url;
        self.http
            .send_json("app_store_keys", Rejection::Unavailable, |c| c.get(url))
            .await
    }

    /// Verify a compact JWS against `keys` and decode its claims
    fn verify_jws<T: DeserializeOwned>(&self, token: &str, keys: &JwkSet) -> BillingResult<T> {
        let header = decode_header(token)?;
        if header.alg != Algorithm::ES256 {
            return Err(BillingError::ReceiptInvalid(format!(
                "unexpected signing algorithm {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| BillingError::ReceiptInvalid("signed payload has no key id".to_string()))?;
        let jwk = keys
            .find(&kid)
            .ok_or_else(|| BillingError::ReceiptInvalid(format!("unknown signing key {kid}")))?;
        let key = DecodingKey::from_jwk(jwk)?;

        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.required_spec_claims = HashSet::from(["iss".to_string()]);
        validation.validate_exp = false;
        validation.validate_aud = false;

        Ok(decode::<T>(token, &key, &validation)?.claims)
    }

    fn check_bundle(&self, bundle_id: Option<&str>) -> BillingResult<()> {
        match bundle_id {
            Some(id) if id != self.config.bundle_id => Err(BillingError::ReceiptInvalid(format!(
                "payload is for bundle {id}"
            ))),
            _ => Ok(()),
        }
    }

    fn transaction_from_signed(&self, signed: SignedTransaction) -> BillingResult<VerifiedTransaction> {
        self.check_bundle(Some(&signed.bundle_id))?;
        let expires_ms = signed.expires_date.ok_or_else(|| {
            BillingError::ReceiptInvalid("signed transaction has no expiresDate".to_string())
        })?;
        Ok(VerifiedTransaction {
            original_transaction_id: signed.original_transaction_id,
            transaction_id: signed.transaction_id,
            product_id: signed.product_id,
            expires_at: from_millis(expires_ms)?,
            environment: signed.environment,
        })
    }

    async fn verify_signed_transaction(&self, token: &str) -> BillingResult<VerifiedTransaction> {
        // Reject garbage before spending a network call on the key set
        decode_header(token)?;
        let keys = self.fetch_keys().await?;
        let signed: SignedTransaction = self.verify_jws(token, &keys)?;
        debug!(
            original_transaction_id = %signed.original_transaction_id,
            "Signed transaction verified"
        );
        self.transaction_from_signed(signed)
    }

    async fn post_verify(&self, url: &str, receipt: &str) -> BillingResult<VerifyReceiptResponse> {
        let body = VerifyReceiptRequest {
            receipt_data: receipt,
            password: &self.config.shared_secret,
            exclude_old_transactions: true,
        };
        self.http
            .send_json("app_store_verify_receipt", Rejection::Receipt, |c| {
                c.post(url).json(&body)
            })
            .await
    }

    async fn verify_legacy_receipt(&self, receipt: &str) -> BillingResult<VerifiedTransaction> {
        let mut response = self.post_verify(&self.config.verify_url, receipt).await?;
        if response.status == STATUS_SANDBOX_RECEIPT {
            info!("Sandbox receipt sent to production - retrying once against sandbox");
            response = self
                .post_verify(&self.config.sandbox_verify_url, receipt)
                .await?;
        }
        check_legacy_status(response.status)?;

        self.check_bundle(
            response
                .receipt
                .as_ref()
                .and_then(|r| r.bundle_id.as_deref()),
        )?;
        let (latest, expires_at) = latest_transaction(&response.latest_receipt_info)?;

        Ok(VerifiedTransaction {
            original_transaction_id: latest.original_transaction_id,
            transaction_id: latest.transaction_id,
            product_id: latest.product_id,
            expires_at,
            environment: response.environment,
        })
    }

    /// Verify and map an App Store Server Notification V2 body.
    ///
    /// Both the outer payload and the nested transaction are re-verified;
    /// nothing in the body is trusted before that.
    pub async fn decode_notification(
        &self,
        body: &[u8],
        received_at: OffsetDateTime,
    ) -> BillingResult<StoreNotification> {
        let body: NotificationBody = serde_json::from_slice(body).map_err(|e| {
            BillingError::ReceiptInvalid(format!("malformed App Store notification: {e}"))
        })?;

        let keys = self.fetch_keys().await?;
        let payload: NotificationPayload = self.verify_jws(&body.signed_payload, &keys)?;
        let data = payload.data.unwrap_or(NotificationData {
            bundle_id: None,
            signed_transaction_info: None,
        });
        self.check_bundle(data.bundle_id.as_deref())?;

        if payload.notification_type == NotificationType::Ignored {
            return Ok(StoreNotification::Ignored {
                reason: "unhandled App Store notification type".to_string(),
            });
        }

        let signed_info = data.signed_transaction_info.ok_or_else(|| {
            BillingError::ReceiptInvalid("notification has no signedTransactionInfo".to_string())
        })?;
        let signed: SignedTransaction = self.verify_jws(&signed_info, &keys)?;
        let occurred_at = match payload.signed_date {
            Some(ms) => from_millis(ms)?,
            None => received_at,
        };

        let kind = match payload.notification_type {
            NotificationType::Subscribed
            | NotificationType::DidRenew
            | NotificationType::RenewalExtended => {
                let transaction = self.transaction_from_signed(signed.clone())?;
                StoreEventKind::Renewed {
                    expires_at: transaction.expires_at,
                    product_id: Some(transaction.product_id),
                }
            }
            NotificationType::Refund | NotificationType::Revoke => {
                self.check_bundle(Some(&signed.bundle_id))?;
                StoreEventKind::Cancelled { revoked: true }
            }
            NotificationType::Expired | NotificationType::GracePeriodExpired => {
                self.check_bundle(Some(&signed.bundle_id))?;
                StoreEventKind::Expired
            }
            NotificationType::Ignored => {
                return Ok(StoreNotification::Ignored {
                    reason: "unhandled App Store notification type".to_string(),
                })
            }
        };

        debug!(
            notification_type = ?payload.notification_type,
            subtype = ?payload.subtype,
            original_transaction_id = %signed.original_transaction_id,
            "App Store notification verified"
        );

        Ok(StoreNotification::Event(StoreEvent {
            platform: Platform::AppStore,
            external_id: signed.original_transaction_id,
            kind,
            occurred_at,
        }))
    }
}
