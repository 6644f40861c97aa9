//! In-memory store for tests and local runs

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use plansync_shared::{
    Platform, ResourceKind, Subscription, SubscriptionStatus, UserAccount,
};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Decide, DecideQuota, ReconcileOutcome, SubscriptionStore};
use crate::entitlement::UserLedger;
use crate::error::{BillingError, BillingResult};
use crate::quota::QuotaDecision;

#[derive(Default)]
struct State {
    users: HashMap<Uuid, UserAccount>,
    subscriptions: HashMap<Uuid, Subscription>,
    usage: HashMap<(Uuid, ResourceKind), u32>,
}

/// Mutex-guarded maps with the same uniqueness and atomicity rules as the
/// Postgres store. One lock covers everything, so every write is serialized.
#[derive(Default)]
pub struct MemorySubscriptionStore {
    state: Mutex<State>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user
    pub async fn insert_user(&self, user: UserAccount) {
        self.state.lock().await.users.insert(user.id, user);
    }

    /// Insert or replace a subscription row as-is
    pub async fn insert_subscription(&self, subscription: Subscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.id, subscription);
    }

    /// Overwrite a usage counter
    pub async fn set_usage(&self, user_id: Uuid, kind: ResourceKind, used: u32) {
        self.state.lock().await.usage.insert((user_id, kind), used);
    }

    /// Total number of subscription rows
    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.subscriptions.len()
    }
}

fn newest_first(mut subscriptions: Vec<Subscription>) -> Vec<Subscription> {
    subscriptions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    subscriptions
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<UserAccount>> {
        Ok(self.state.lock().await.users.get(&user_id).cloned())
    }

    async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.state.lock().await.subscriptions.get(&subscription_id).cloned())
    }

    async fn find_by_external_id(
        &self,
        platform: Platform,
        external_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .values()
            .find(|s| s.platform == platform && s.external_id == external_id)
            .cloned())
    }

    async fn list_subscriptions(&self, user_id: Uuid) -> BillingResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        Ok(newest_first(
            state
                .subscriptions
                .values()
                .filter(|s| s.user_id == user_id)
                .cloned()
                .collect(),
        ))
    }

    async fn expiry_candidates(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut rows: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| {
                s.current_period_end <= now
                    && !s.is_fully_expired()
                    && match s.status {
                        SubscriptionStatus::Active | SubscriptionStatus::Expired => true,
                        SubscriptionStatus::Cancelled => s.cancel_at_period_end,
                    }
            })
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.current_period_end);
        Ok(rows)
    }

    async fn expiring_between(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut rows: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| s.is_active() && s.current_period_end >= start && s.current_period_end < end)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.current_period_end);
        Ok(rows)
    }

    async fn resource_usage(&self, user_id: Uuid) -> BillingResult<BTreeMap<ResourceKind, u32>> {
        let state = self.state.lock().await;
        Ok(state
            .usage
            .iter()
            .filter(|((owner, _), _)| *owner == user_id)
            .map(|((_, kind), used)| (*kind, *used))
            .collect())
    }

    async fn reconcile(
        &self,
        user_id: Uuid,
        decide: &Decide<'_>,
    ) -> BillingResult<Option<ReconcileOutcome>> {
        let mut state = self.state.lock().await;

        let user = state
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("user {user_id}")))?;
        let ledger = UserLedger {
            user,
            subscriptions: newest_first(
                state
                    .subscriptions
                    .values()
                    .filter(|s| s.user_id == user_id)
                    .cloned()
                    .collect(),
            ),
        };

        let Some(reconciliation) = decide(&ledger)? else {
            return Ok(None);
        };

        // Validate every write before touching state so a failure leaves nothing behind
        for row in &reconciliation.writes {
            if row.user_id != user_id {
                return Err(BillingError::Internal(format!(
                    "subscription {} does not belong to user {user_id}",
                    row.id
                )));
            }
            let taken = state
                .subscriptions
                .values()
                .any(|s| s.id != row.id && s.external_id == row.external_id);
            if taken {
                return Err(BillingError::ConcurrentModification(format!(
                    "external id {} already recorded",
                    row.external_id
                )));
            }
        }

        for row in &reconciliation.writes {
            state.subscriptions.insert(row.id, row.clone());
        }
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::NotFound(format!("user {user_id}")))?;
        user.plan = reconciliation.plan;

        Ok(Some(ReconcileOutcome {
            user: user.clone(),
            written: reconciliation.writes,
            notices: reconciliation.notices,
        }))
    }

    async fn reserve(
        &self,
        user_id: Uuid,
        kind: ResourceKind,
        decide: &DecideQuota<'_>,
    ) -> BillingResult<QuotaDecision> {
        let mut state = self.state.lock().await;
        let plan = state
            .users
            .get(&user_id)
            .map(|u| u.plan)
            .ok_or_else(|| BillingError::NotFound(format!("user {user_id}")))?;

        let used = state.usage.entry((user_id, kind)).or_insert(0);
        let decision = decide(plan, *used);
        if decision.is_reserved() {
            *used += 1;
        }
        Ok(decision)
    }

    async fn release(&self, user_id: Uuid, kind: ResourceKind) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if let Some(used) = state.usage.get_mut(&(user_id, kind)) {
            *used = used.saturating_sub(1);
        }
        Ok(())
    }
}
