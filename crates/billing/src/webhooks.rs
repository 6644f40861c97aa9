//! Store webhook processing
//!
//! Both stores deliver at least once and in any order. Every notification is
//! verified and decoded into a [`StoreNotification`] before anything in it is
//! used, then applied through the same transition as any other write.

use std::sync::Arc;

use plansync_shared::Platform;
use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info, warn};

use crate::app_store::AppStoreClient;
use crate::entitlement::{apply_event, StoreEvent, UserLedger};
use crate::error::{BillingError, BillingResult};
use crate::play_store::PlayStoreClient;
use crate::store::SubscriptionStore;

/// A verified notification, mapped to the events the state machine knows
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreNotification {
    Event(StoreEvent),
    /// Valid but irrelevant: test pings, one-time products, other types
    Ignored { reason: String },
}

/// What handling a notification did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The transition was applied (or was already in place)
    Applied,
    Ignored,
    /// The store named a purchase this system never recorded
    UnknownSubscription,
}

/// How to answer the delivering store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAck {
    /// 2xx: the store stops delivering this notification
    Acknowledge,
    /// Non-2xx: the store redelivers later
    Redeliver,
}

/// Map a handling result to the inbound response.
///
/// Transient failures ask for redelivery. Anything permanent (bad signature,
/// malformed body) would fail identically next time, so it is acknowledged.
pub fn acknowledge(platform: Platform, result: &BillingResult<WebhookOutcome>) -> WebhookAck {
    match result {
        Ok(_) => WebhookAck::Acknowledge,
        Err(e) if e.is_retryable() => {
            warn!(platform = %platform, error = %e, "Webhook failed transiently - requesting redelivery");
            WebhookAck::Redeliver
        }
        Err(e) => {
            error!(platform = %platform, error = %e, "Webhook rejected - acknowledging to stop redelivery");
            WebhookAck::Acknowledge
        }
    }
}

#[derive(Clone)]
pub struct WebhookProcessor {
    store: Arc<dyn SubscriptionStore>,
    app_store: AppStoreClient,
    play_store: PlayStoreClient,
    grace: Duration,
}

impl WebhookProcessor {
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

    pub async fn handle(&self, platform: Platform, body: &[u8]) -> BillingResult<WebhookOutcome> {
        self.handle_at(platform, body, OffsetDateTime::now_utc()).await
    }

    pub async fn handle_at(
        &self,
        platform: Platform,
        body: &[u8],
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let notification = match platform {
            Platform::AppStore => self.app_store.decode_notification(body, now).await?,
            Platform::PlayStore => self.play_store.decode_notification(body, now).await?,
        };

        match notification {
            StoreNotification::Ignored { reason } => {
                debug!(platform = %platform, reason = %reason, "Ignoring store notification");
                Ok(WebhookOutcome::Ignored)
            }
            StoreNotification::Event(event) => self.apply(event, now).await,
        }
    }

    /// Apply an already-verified event
    pub async fn apply(&self, event: StoreEvent, now: OffsetDateTime) -> BillingResult<WebhookOutcome> {
        let Some(existing) = self
            .store
            .find_by_external_id(event.platform, &event.external_id)
            .await?
        else {
            info!(
                platform = %event.platform,
                external_id = %event.external_id,
                "Notification for unknown subscription - ignoring"
            );
            return Ok(WebhookOutcome::UnknownSubscription);
        };

        let grace = self.grace;
        let decide = |ledger: &UserLedger| apply_event(ledger, &event, now, grace);
        match self.store.reconcile(existing.user_id, &decide).await {
            Ok(Some(outcome)) => {
                info!(
                    user_id = %outcome.user.id,
                    subscription_id = %existing.id,
                    event = ?event.kind,
                    plan = %outcome.user.plan,
                    "Store notification applied"
                );
                Ok(WebhookOutcome::Applied)
            }
            Ok(None) => {
                debug!(
                    subscription_id = %existing.id,
                    event = ?event.kind,
                    "Store notification changed nothing"
                );
                Ok(WebhookOutcome::Applied)
            }
            // The row vanished between lookup and lock
            Err(BillingError::NotFound(_)) => Ok(WebhookOutcome::UnknownSubscription),
            Err(e) => Err(e),
        }
    }
}
