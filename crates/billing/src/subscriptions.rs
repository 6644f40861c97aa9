//! Read-side entitlement queries and user-initiated cancellation

use std::sync::Arc;

use plansync_shared::Subscription;
use time::{Duration, OffsetDateTime};
use tracing::info;
use uuid::Uuid;

use crate::entitlement::{apply_cancel, compute_status, EntitlementStatus, UserLedger};
use crate::error::{BillingError, BillingResult};
use crate::store::SubscriptionStore;

#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    grace: Duration,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn SubscriptionStore>, grace: Duration) -> Self {
        Self { store, grace }
    }

    pub async fn get_status(&self, user_id: Uuid) -> BillingResult<EntitlementStatus> {
        self.get_status_at(user_id, OffsetDateTime::now_utc()).await
    }

    /// Current entitlement, derived from the stored rows as of `now`
    pub async fn get_status_at(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<EntitlementStatus> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {user_id}")))?;
        let subscriptions = self.store.list_subscriptions(user_id).await?;
        Ok(compute_status(&UserLedger { user, subscriptions }, now, self.grace))
    }

    /// Every subscription the user ever had, newest first
    pub async fn get_history(&self, user_id: Uuid) -> BillingResult<Vec<Subscription>> {
        if self.store.get_user(user_id).await?.is_none() {
            return Err(BillingError::NotFound(format!("user {user_id}")));
        }
        self.store.list_subscriptions(user_id).await
    }

    pub async fn cancel(&self, user_id: Uuid, subscription_id: Uuid) -> BillingResult<Subscription> {
        self.cancel_at(user_id, subscription_id, OffsetDateTime::now_utc())
            .await
    }

    /// Stop renewal. The user keeps the plan until the period ends.
    pub async fn cancel_at(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let grace = self.grace;
        let decide = |ledger: &UserLedger| apply_cancel(ledger, subscription_id, now, grace);

        // apply_cancel only sees this user's rows, so another user's id is NotFound
        match self.store.reconcile(user_id, &decide).await? {
            Some(outcome) => {
                let cancelled = outcome
                    .written
                    .into_iter()
                    .find(|s| s.id == subscription_id)
                    .ok_or_else(|| {
                        BillingError::Internal(format!("subscription {subscription_id} was not written"))
                    })?;
                info!(
                    user_id = %user_id,
                    subscription_id = %subscription_id,
                    access_until = %cancelled.current_period_end,
                    "Subscription cancelled at period end"
                );
                Ok(cancelled)
            }
            None => self
                .store
                .get_subscription(subscription_id)
                .await?
                .filter(|s| s.user_id == user_id)
                .ok_or_else(|| BillingError::NotFound(format!("subscription {subscription_id}"))),
        }
    }
}
