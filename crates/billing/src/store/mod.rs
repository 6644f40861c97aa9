//! Storage seam for users, subscriptions and quota counters.
//!
//! Writes go through two lock-then-decide primitives: [`SubscriptionStore::reconcile`]
//! for anything touching subscriptions or the user's plan, and
//! [`SubscriptionStore::reserve`] for quota. Both hold the user's row lock for
//! the whole decision so concurrent callers for one user serialize.

mod memory;
mod postgres;

pub use memory::MemorySubscriptionStore;
pub use postgres::PgSubscriptionStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use plansync_shared::{Platform, PlanTier, ResourceKind, Subscription, UserAccount};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entitlement::{Notice, Reconciliation, UserLedger};
use crate::error::BillingResult;
use crate::quota::QuotaDecision;

/// Decision over a locked ledger. `Ok(None)` means nothing to write.
pub type Decide<'a> = dyn Fn(&UserLedger) -> BillingResult<Option<Reconciliation>> + Send + Sync + 'a;

/// Quota decision over the locked plan and current usage count
pub type DecideQuota<'a> = dyn Fn(PlanTier, u32) -> QuotaDecision + Send + Sync + 'a;

/// What a committed reconciliation wrote
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// The user after the plan update
    pub user: UserAccount,
    /// Subscription rows as written
    pub written: Vec<Subscription>,
    /// Notices claimed in this transaction, to dispatch after commit
    pub notices: Vec<Notice>,
}

impl ReconcileOutcome {
    pub fn find(&self, platform: Platform, external_id: &str) -> Option<&Subscription> {
        self.written
            .iter()
            .find(|s| s.platform == platform && s.external_id == external_id)
    }
}

/// Trait for persisting entitlement state.
///
/// `PgSubscriptionStore` is the production implementation;
/// `MemorySubscriptionStore` mirrors its semantics for tests and local runs.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    // Reads

    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<UserAccount>>;

    async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<Option<Subscription>>;

    /// Look up a subscription by its store identity, across all users
    async fn find_by_external_id(
        &self,
        platform: Platform,
        external_id: &str,
    ) -> BillingResult<Option<Subscription>>;

    /// All subscriptions of a user, newest first
    async fn list_subscriptions(&self, user_id: Uuid) -> BillingResult<Vec<Subscription>>;

    /// Subscriptions whose period ended at or before `now` and that are not
    /// yet fully expired
    async fn expiry_candidates(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>>;

    /// ACTIVE subscriptions with a period end in `[start, end)`
    async fn expiring_between(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>>;

    /// Current usage counters per resource kind; missing kinds are zero
    async fn resource_usage(&self, user_id: Uuid) -> BillingResult<BTreeMap<ResourceKind, u32>>;

    // Writes

    /// Lock the user and their subscriptions, decide, persist, commit
    async fn reconcile(
        &self,
        user_id: Uuid,
        decide: &Decide<'_>,
    ) -> BillingResult<Option<ReconcileOutcome>>;

    /// Lock the user's plan and usage counter, decide, and increment the
    /// counter when the decision reserves a slot
    async fn reserve(
        &self,
        user_id: Uuid,
        kind: ResourceKind,
        decide: &DecideQuota<'_>,
    ) -> BillingResult<QuotaDecision>;

    /// Give back one slot; never drops below zero
    async fn release(&self, user_id: Uuid, kind: ResourceKind) -> BillingResult<()>;
}
