//! Quota enforcement for plan-gated resources

use std::sync::Arc;

use plansync_shared::{PlanTier, QuotaUsage, ResourceKind, UNLIMITED};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::SubscriptionStore;

/// Outcome of a reservation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum QuotaDecision {
    /// Slot reserved; `remaining` is `None` for unlimited tiers
    Reserved { remaining: Option<u32> },
    /// Limit reached, nothing reserved
    Exceeded { limit: u32, current: u32 },
}

impl QuotaDecision {
    pub fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved { .. })
    }
}

/// Decide whether one more resource of `kind` fits under the plan's limit
pub fn decide(plan: PlanTier, kind: ResourceKind, current: u32) -> QuotaDecision {
    let limit = plan.limit_for(kind);
    if limit == UNLIMITED {
        return QuotaDecision::Reserved { remaining: None };
    }
    if current >= limit {
        QuotaDecision::Exceeded { limit, current }
    } else {
        QuotaDecision::Reserved {
            remaining: Some(limit - current - 1),
        }
    }
}

/// Usage report for one kind
pub fn usage_for(plan: PlanTier, kind: ResourceKind, used: u32) -> QuotaUsage {
    let limit = plan.limit_for(kind);
    let (limit, remaining) = if limit == UNLIMITED {
        (None, None)
    } else {
        (Some(limit), Some(limit.saturating_sub(used)))
    };
    QuotaUsage {
        kind,
        used,
        limit,
        remaining,
    }
}

/// Quota enforcement service
#[derive(Clone)]
pub struct QuotaEnforcer {
    store: Arc<dyn SubscriptionStore>,
}

impl QuotaEnforcer {
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self { store }
    }

    /// Atomically check the limit and count one more resource of `kind`.
    ///
    /// Callers create the resource only on `Reserved`, and call
    /// [`QuotaEnforcer::release`] if that creation fails.
    pub async fn check_and_reserve(
        &self,
        user_id: Uuid,
        kind: ResourceKind,
    ) -> BillingResult<QuotaDecision> {
        let decision = self
            .store
            .reserve(user_id, kind, &|plan, current| decide(plan, kind, current))
            .await?;

        match decision {
            QuotaDecision::Reserved { remaining } => {
                debug!(user_id = %user_id, kind = %kind, remaining = ?remaining, "Quota reserved");
            }
            QuotaDecision::Exceeded { limit, current } => {
                info!(user_id = %user_id, kind = %kind, limit, current, "Quota exceeded");
            }
        }
        Ok(decision)
    }

    /// Return a slot after the resource was deleted
    pub async fn release(&self, user_id: Uuid, kind: ResourceKind) -> BillingResult<()> {
        self.store.release(user_id, kind).await
    }

    /// Used/limit/remaining for every resource kind
    pub async fn usage(&self, user_id: Uuid) -> BillingResult<Vec<QuotaUsage>> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {user_id}")))?;
        let counts = self.store.resource_usage(user_id).await?;

        Ok(ResourceKind::ALL
            .iter()
            .map(|kind| usage_for(user.plan, *kind, counts.get(kind).copied().unwrap_or(0)))
            .collect())
    }
}
