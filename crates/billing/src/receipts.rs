//! Receipt validation
//!
//! Turns a client-submitted receipt into canonical purchase facts and upserts
//! the subscription those facts describe.

use std::sync::Arc;

use plansync_shared::{Platform, Subscription};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app_store::AppStoreClient;
use crate::entitlement::{apply_validation, PurchaseFacts, UserLedger};
use crate::error::{BillingError, BillingResult};
use crate::play_store::PlayStoreClient;
use crate::products::{self, Product};
use crate::store::SubscriptionStore;

/// A receipt submission from a client
#[derive(Debug, Clone, Copy)]
pub struct ReceiptSubmission<'a> {
    pub platform: Platform,
    pub product_id: &'a str,
    /// JWS transaction or legacy blob for the App Store, purchase token for the Play Store
    pub receipt: &'a str,
    /// Client-side transaction id, recorded for support lookups only
    pub client_transaction_id: Option<&'a str>,
}

#[derive(Clone)]
pub struct ReceiptValidator {
    store: Arc<dyn SubscriptionStore>,
    app_store: AppStoreClient,
    play_store: PlayStoreClient,
    grace: Duration,
}

impl ReceiptValidator {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        app_store: AppStoreClient,
        play_store: PlayStoreClient,
        grace: Duration,
    ) -> Self {
        Self {
            store,
            app_store,
            play_store,
            grace,
        }
    }

    /// Verify a receipt with its store and record the subscription for `user_id`
    pub async fn validate(
        &self,
        user_id: Uuid,
        submission: ReceiptSubmission<'_>,
    ) -> BillingResult<Subscription> {
        self.validate_at(user_id, submission, OffsetDateTime::now_utc())
            .await
    }

    pub async fn validate_at(
        &self,
        user_id: Uuid,
        submission: ReceiptSubmission<'_>,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let product = products::lookup(submission.product_id)?;
        if submission.receipt.trim().is_empty() {
            return Err(BillingError::ReceiptInvalid("empty receipt".to_string()));
        }

        let facts = match submission.platform {
            Platform::AppStore => self.verify_app_store(product, submission.receipt).await?,
            Platform::PlayStore => {
                self.verify_play_store(product, submission.receipt, now)
                    .await?
            }
        };

        if let Some(existing) = self
            .store
            .find_by_external_id(facts.platform, &facts.external_id)
            .await?
        {
            if existing.user_id != user_id {
                warn!(
                    user_id = %user_id,
                    owner_id = %existing.user_id,
                    platform = %facts.platform,
                    "Receipt already linked to another account"
                );
                return Err(BillingError::ReceiptInvalid(
                    "receipt is linked to another account".to_string(),
                ));
            }
        }

        let grace = self.grace;
        let client_transaction_id = submission.client_transaction_id;
        let decide = |ledger: &UserLedger| {
            apply_validation(ledger, &facts, client_transaction_id, now, grace).map(Some)
        };
        let outcome = self
            .store
            .reconcile(user_id, &decide)
            .await?
            .ok_or_else(|| BillingError::Internal("validation wrote nothing".to_string()))?;

        let subscription = outcome
            .find(facts.platform, &facts.external_id)
            .cloned()
            .ok_or_else(|| BillingError::Internal("validated subscription was not written".to_string()))?;

        info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            platform = %subscription.platform,
            product_id = %subscription.product_id,
            status = %subscription.status,
            plan = %outcome.user.plan,
            "Receipt validated"
        );
        Ok(subscription)
    }

    async fn verify_app_store(&self, product: &Product, receipt: &str) -> BillingResult<PurchaseFacts> {
        let transaction = self.app_store.verify_receipt(receipt).await?;
        if transaction.product_id != product.id {
            return Err(BillingError::ReceiptInvalid(format!(
                "receipt is for product {}, not {}",
                transaction.product_id, product.id
            )));
        }

        Ok(PurchaseFacts {
            platform: Platform::AppStore,
            external_id: transaction.original_transaction_id,
            product_id: product.id.to_string(),
            plan: product.plan,
            expires_at: transaction.expires_at,
            order_id: transaction.transaction_id,
            environment: transaction.environment,
        })
    }

    async fn verify_play_store(
        &self,
        product: &Product,
        purchase_token: &str,
        now: OffsetDateTime,
    ) -> BillingResult<PurchaseFacts> {
        let purchase = self
            .play_store
            .verify_subscription(product.id, purchase_token, now)
            .await?;
        let environment = if purchase.test_purchase {
            "Sandbox"
        } else {
            "Production"
        };

        Ok(PurchaseFacts {
            platform: Platform::PlayStore,
            external_id: purchase.purchase_token,
            product_id: product.id.to_string(),
            plan: product.plan,
            expires_at: purchase.expires_at,
            order_id: purchase.order_id,
            environment: Some(environment.to_string()),
        })
    }
}
