//! Entitlement Module
//!
//! Pure decision logic for subscription state. Every function here takes the
//! current rows plus a new fact and returns the rows to write; the store
//! adapter applies the result inside one transaction.
//!
//! ## Design Principles
//!
//! 1. **Single Source of Truth**: `entitled_plan()` is THE function that decides a user's plan
//! 2. **Deterministic**: `now` is always an argument, never read from the clock
//! 3. **Forward-only**: period ends never move backwards and one-time markers are never cleared
//!    except by a renewal into a new period

use plansync_shared::{
    Platform, PlanTier, Subscription, SubscriptionMetadata, SubscriptionStatus, UserAccount,
};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::products;

// =============================================================================
// Inputs
// =============================================================================

/// Snapshot of a user and all their subscriptions, read under lock
#[derive(Debug, Clone)]
pub struct UserLedger {
    pub user: UserAccount,
    pub subscriptions: Vec<Subscription>,
}

impl UserLedger {
    pub fn find(&self, platform: Platform, external_id: &str) -> Option<&Subscription> {
        self.subscriptions
            .iter()
            .find(|s| s.platform == platform && s.external_id == external_id)
    }

    pub fn get(&self, subscription_id: Uuid) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| s.id == subscription_id)
    }
}

/// Canonical facts extracted from a verified store receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseFacts {
    pub platform: Platform,
    /// Stable purchase identity (original transaction id or purchase token)
    pub external_id: String,
    pub product_id: String,
    pub plan: PlanTier,
    pub expires_at: OffsetDateTime,
    pub order_id: Option<String>,
    pub environment: Option<String>,
}

/// A store lifecycle event, already verified and mapped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub platform: Platform,
    pub external_id: String,
    pub kind: StoreEventKind,
    /// When the store says the event happened
    pub occurred_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEventKind {
    /// Renewed, recovered or restarted; carries the new period end
    Renewed {
        expires_at: OffsetDateTime,
        product_id: Option<String>,
    },
    /// Cancelled, refunded or revoked. `revoked` removes access immediately;
    /// otherwise access continues until the period end.
    Cancelled { revoked: bool },
    Expired,
}

// =============================================================================
// Outputs
// =============================================================================

/// A user-facing notice to dispatch once the transition is committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub subscription_id: Uuid,
    pub kind: NoticeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeKind {
    GracePeriod { grace_end: OffsetDateTime },
    Expired,
    ExpiryWarning {
        expires_at: OffsetDateTime,
        days_left: u32,
    },
}

/// Rows to persist and the resulting user plan
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub writes: Vec<Subscription>,
    pub plan: PlanTier,
    pub notices: Vec<Notice>,
}

impl Reconciliation {
    /// Build a reconciliation whose plan is recomputed from the ledger with
    /// `writes` applied on top
    fn settle(
        ledger: &UserLedger,
        writes: Vec<Subscription>,
        notices: Vec<Notice>,
        now: OffsetDateTime,
        grace: Duration,
    ) -> Self {
        let merged = merge(ledger, &writes);
        Self {
            plan: entitled_plan(&merged, now, grace),
            writes,
            notices,
        }
    }
}

fn merge(ledger: &UserLedger, writes: &[Subscription]) -> Vec<Subscription> {
    let mut merged: Vec<Subscription> = ledger
        .subscriptions
        .iter()
        .filter(|s| !writes.iter().any(|w| w.id == s.id))
        .cloned()
        .collect();
    merged.extend(writes.iter().cloned());
    merged
}

// =============================================================================
// Entitlement computation
// =============================================================================

/// Unified entitlement state for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementState {
    /// Never subscribed
    Free,
    /// Subscription active and in good standing
    Active,
    /// Subscription cancelled but still in paid period
    CanceledGrace,
    /// Period ended, renewal pending, still inside the grace window
    PastDueGrace,
    /// Had a subscription, no access left
    Expired,
}

impl std::fmt::Display for EntitlementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntitlementState::Free => write!(f, "free"),
            EntitlementState::Active => write!(f, "active"),
            EntitlementState::CanceledGrace => write!(f, "canceled_grace"),
            EntitlementState::PastDueGrace => write!(f, "past_due_grace"),
            EntitlementState::Expired => write!(f, "expired"),
        }
    }
}

/// Complete entitlement information for a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementStatus {
    pub user_id: Uuid,
    pub plan: PlanTier,
    pub state: EntitlementState,
    /// The subscription granting the plan, if any
    pub subscription: Option<Subscription>,
    /// When access ends unless renewed
    #[serde(with = "time::serde::rfc3339::option")]
    pub access_until: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
}

/// End of the grace window for a subscription whose period has ended
pub fn grace_end(subscription: &Subscription, grace: Duration) -> OffsetDateTime {
    subscription
        .metadata
        .grace_period_end
        .unwrap_or(subscription.current_period_end + grace)
}

/// Whether a subscription currently grants its plan, and until when
fn access_until(
    subscription: &Subscription,
    now: OffsetDateTime,
    grace: Duration,
) -> Option<OffsetDateTime> {
    if subscription.is_fully_expired() {
        return None;
    }
    match subscription.status {
        SubscriptionStatus::Active => Some(subscription.current_period_end),
        SubscriptionStatus::Cancelled
            if subscription.cancel_at_period_end && subscription.current_period_end > now =>
        {
            Some(subscription.current_period_end)
        }
        SubscriptionStatus::Expired if grace_end(subscription, grace) > now => {
            Some(grace_end(subscription, grace))
        }
        _ => None,
    }
}

/// The subscription that determines the user's plan.
///
/// An ACTIVE row always wins; otherwise the most recently created row still
/// inside a paid period or grace window.
pub fn entitling_subscription(
    subscriptions: &[Subscription],
    now: OffsetDateTime,
    grace: Duration,
) -> Option<&Subscription> {
    let active = subscriptions
        .iter()
        .filter(|s| s.is_active() && !s.is_fully_expired())
        .max_by_key(|s| s.created_at);
    active.or_else(|| {
        subscriptions
            .iter()
            .filter(|s| access_until(s, now, grace).is_some())
            .max_by_key(|s| s.created_at)
    })
}

/// Plan tier the user is entitled to right now
pub fn entitled_plan(subscriptions: &[Subscription], now: OffsetDateTime, grace: Duration) -> PlanTier {
    entitling_subscription(subscriptions, now, grace)
        .map(|s| s.plan)
        .unwrap_or(PlanTier::Free)
}

/// Compute the displayable entitlement from a ledger snapshot
pub fn compute_status(ledger: &UserLedger, now: OffsetDateTime, grace: Duration) -> EntitlementStatus {
    let entitling = entitling_subscription(&ledger.subscriptions, now, grace);

    let state = match entitling {
        Some(s) => match s.status {
            SubscriptionStatus::Active => EntitlementState::Active,
            SubscriptionStatus::Cancelled => EntitlementState::CanceledGrace,
            SubscriptionStatus::Expired => EntitlementState::PastDueGrace,
        },
        None if ledger.subscriptions.is_empty() => EntitlementState::Free,
        None => EntitlementState::Expired,
    };

    EntitlementStatus {
        user_id: ledger.user.id,
        plan: entitling.map(|s| s.plan).unwrap_or(PlanTier::Free),
        state,
        access_until: entitling.and_then(|s| access_until(s, now, grace)),
        subscription: entitling.cloned(),
        computed_at: now,
    }
}

/// Status implied by an expiry instant
pub fn status_for_expiry(expires_at: OffsetDateTime, now: OffsetDateTime) -> SubscriptionStatus {
    if expires_at > now {
        SubscriptionStatus::Active
    } else {
        SubscriptionStatus::Expired
    }
}

// =============================================================================
// Transitions
// =============================================================================

/// Cancel every other ACTIVE subscription of the user in favour of `winner`
fn supersede_others(
    ledger: &UserLedger,
    winner: &Subscription,
    now: OffsetDateTime,
) -> Vec<Subscription> {
    ledger
        .subscriptions
        .iter()
        .filter(|s| s.id != winner.id && s.is_active())
        .map(|s| {
            let mut superseded = s.clone();
            superseded.status = SubscriptionStatus::Cancelled;
            superseded.cancel_at_period_end = false;
            superseded.metadata.superseded_by = Some(winner.external_id.clone());
            superseded.updated_at = now;
            superseded
        })
        .collect()
}

/// Upsert a verified purchase by its external identity
pub fn apply_validation(
    ledger: &UserLedger,
    facts: &PurchaseFacts,
    client_transaction_id: Option<&str>,
    now: OffsetDateTime,
    grace: Duration,
) -> BillingResult<Reconciliation> {
    let mut subscription = match ledger.find(facts.platform, &facts.external_id) {
        Some(existing) => {
            let mut updated = existing.clone();
            if facts.expires_at > existing.current_period_end {
                // A later expiry is a renewal: new period, fresh markers
                updated.current_period_end = facts.expires_at;
                updated.status = status_for_expiry(facts.expires_at, now);
                updated.cancel_at_period_end = false;
                updated.metadata.reset_period_markers();
                updated.metadata.superseded_by = None;
            } else if existing.is_active() && existing.current_period_end <= now {
                updated.status = SubscriptionStatus::Expired;
            }
            updated.plan = facts.plan;
            updated.product_id = facts.product_id.clone();
            updated
        }
        None => Subscription {
            id: Uuid::new_v4(),
            user_id: ledger.user.id,
            plan: facts.plan,
            status: status_for_expiry(facts.expires_at, now),
            platform: facts.platform,
            external_id: facts.external_id.clone(),
            product_id: facts.product_id.clone(),
            current_period_end: facts.expires_at,
            cancel_at_period_end: false,
            metadata: SubscriptionMetadata::default(),
            created_at: now,
            updated_at: now,
        },
    };

    let metadata = &mut subscription.metadata;
    metadata.last_validated_at = Some(now);
    metadata.platform = Some(facts.platform);
    metadata.product_id = Some(facts.product_id.clone());
    if facts.order_id.is_some() {
        metadata.order_id = facts.order_id.clone();
    }
    if facts.environment.is_some() {
        metadata.environment = facts.environment.clone();
    }
    if let Some(tx_id) = client_transaction_id {
        metadata.client_transaction_id = Some(tx_id.to_string());
    }
    subscription.updated_at = now;

    let mut writes = Vec::new();
    if subscription.is_active() {
        writes.extend(supersede_others(ledger, &subscription, now));
    }
    writes.insert(0, subscription);

    Ok(Reconciliation::settle(ledger, writes, Vec::new(), now, grace))
}

/// Apply a store event to one subscription row.
///
/// Returns `None` when the event is stale or changes nothing.
pub fn transition(
    subscription: &Subscription,
    event: &StoreEvent,
    now: OffsetDateTime,
) -> BillingResult<Option<Subscription>> {
    if subscription.platform != event.platform || subscription.external_id != event.external_id {
        return Err(BillingError::IdentityMismatch(format!(
            "subscription {} is {}:{}, event is for {}:{}",
            subscription.id,
            subscription.platform,
            subscription.external_id,
            event.platform,
            event.external_id
        )));
    }

    let stale = subscription
        .metadata
        .last_event_at
        .is_some_and(|last| event.occurred_at < last);

    let mut next = subscription.clone();
    match &event.kind {
        StoreEventKind::Renewed {
            expires_at,
            product_id,
        } => {
            if *expires_at > next.current_period_end {
                next.current_period_end = *expires_at;
                next.metadata.reset_period_markers();
            }
            if next.current_period_end > now {
                next.status = SubscriptionStatus::Active;
                next.cancel_at_period_end = false;
                next.metadata.superseded_by = None;
                if next.is_fully_expired() {
                    next.metadata.reset_period_markers();
                }
            }
            if let Some(product) = product_id.as_deref().and_then(|p| products::lookup(p).ok()) {
                next.plan = product.plan;
                next.product_id = product.id.to_string();
                next.metadata.product_id = Some(product.id.to_string());
            }
        }
        StoreEventKind::Cancelled { .. } | StoreEventKind::Expired if stale => return Ok(None),
        StoreEventKind::Cancelled { revoked: false } => {
            if next.is_active() {
                next.status = SubscriptionStatus::Cancelled;
                next.cancel_at_period_end = true;
            }
        }
        StoreEventKind::Cancelled { revoked: true } => {
            next.status = SubscriptionStatus::Cancelled;
            next.cancel_at_period_end = false;
        }
        StoreEventKind::Expired => {
            if next.is_active() {
                next.status = SubscriptionStatus::Expired;
            }
        }
    }

    if next.metadata.last_event_at.map_or(true, |last| event.occurred_at > last) {
        next.metadata.last_event_at = Some(event.occurred_at);
    }

    if next == *subscription {
        return Ok(None);
    }
    next.updated_at = now;
    Ok(Some(next))
}

/// Apply a store event to the ledger row it names
pub fn apply_event(
    ledger: &UserLedger,
    event: &StoreEvent,
    now: OffsetDateTime,
    grace: Duration,
) -> BillingResult<Option<Reconciliation>> {
    let current = ledger.find(event.platform, &event.external_id).ok_or_else(|| {
        BillingError::NotFound(format!("subscription {}:{}", event.platform, event.external_id))
    })?;

    let Some(next) = transition(current, event, now)? else {
        return Ok(None);
    };

    let mut writes = Vec::new();
    if next.is_active() {
        writes.extend(supersede_others(ledger, &next, now));
    }
    writes.insert(0, next);

    Ok(Some(Reconciliation::settle(ledger, writes, Vec::new(), now, grace)))
}

/// User-requested cancellation. Access continues until the period end.
pub fn apply_cancel(
    ledger: &UserLedger,
    subscription_id: Uuid,
    now: OffsetDateTime,
    grace: Duration,
) -> BillingResult<Option<Reconciliation>> {
    let current = ledger
        .get(subscription_id)
        .ok_or_else(|| BillingError::NotFound(format!("subscription {subscription_id}")))?;

    match current.status {
        SubscriptionStatus::Cancelled => Ok(None),
        SubscriptionStatus::Expired => Err(BillingError::InvalidInput(format!(
            "subscription {subscription_id} has already expired"
        ))),
        SubscriptionStatus::Active => {
            let mut next = current.clone();
            next.status = SubscriptionStatus::Cancelled;
            next.cancel_at_period_end = true;
            next.updated_at = now;
            Ok(Some(Reconciliation::settle(ledger, vec![next], Vec::new(), now, grace)))
        }
    }
}

/// Whether the row ever covered a paid period after it was recorded.
///
/// A receipt restored after it lapsed is stored already expired and gets no
/// lifecycle notices.
fn ever_active(subscription: &Subscription) -> bool {
    subscription.created_at < subscription.current_period_end
}

/// Whether the row was the one granting the user's plan right before it
/// lost access
fn was_entitling(ledger: &UserLedger, subscription: &Subscription, grace: Duration) -> bool {
    if !ever_active(subscription) {
        return false;
    }
    let last_access = match subscription.status {
        SubscriptionStatus::Cancelled if !subscription.cancel_at_period_end => return false,
        SubscriptionStatus::Cancelled => subscription.current_period_end,
        SubscriptionStatus::Active | SubscriptionStatus::Expired => grace_end(subscription, grace),
    };
    entitling_subscription(&ledger.subscriptions, last_access - Duration::seconds(1), grace)
        .is_some_and(|s| s.id == subscription.id)
}

/// Advance one subscription past its period end.
///
/// Inside the grace window an ACTIVE row becomes EXPIRED and the user keeps
/// the plan; at or past the window the row is fully expired and the plan is
/// recomputed without it. The expiry notice goes out only when that drops the
/// user to FREE and the row was the one entitling them. Each notice is claimed
/// in metadata so a re-run sends nothing.
pub fn apply_expiry_sweep(
    ledger: &UserLedger,
    subscription_id: Uuid,
    now: OffsetDateTime,
    grace: Duration,
) -> BillingResult<Option<Reconciliation>> {
    let current = ledger
        .get(subscription_id)
        .ok_or_else(|| BillingError::NotFound(format!("subscription {subscription_id}")))?;

    if current.is_fully_expired() || current.current_period_end > now {
        return Ok(None);
    }

    let mut next = current.clone();
    let mut notices = Vec::new();

    match current.status {
        SubscriptionStatus::Active | SubscriptionStatus::Expired => {
            let grace_end = grace_end(current, grace);
            next.status = SubscriptionStatus::Expired;
            next.metadata.grace_period_end = Some(grace_end);
            if now >= grace_end {
                next.metadata.fully_expired_at = Some(now);
            } else if ever_active(current) && next.metadata.grace_notice_sent_at.is_none() {
                next.metadata.grace_notice_sent_at = Some(now);
                notices.push(Notice {
                    subscription_id: next.id,
                    kind: NoticeKind::GracePeriod { grace_end },
                });
            }
        }
        SubscriptionStatus::Cancelled if current.cancel_at_period_end => {
            next.metadata.fully_expired_at = Some(now);
        }
        SubscriptionStatus::Cancelled => return Ok(None),
    }

    if next == *current {
        return Ok(None);
    }
    next.updated_at = now;

    let plan = entitled_plan(&merge(ledger, std::slice::from_ref(&next)), now, grace);
    if next.is_fully_expired()
        && plan == PlanTier::Free
        && next.metadata.expiry_notice_sent_at.is_none()
        && was_entitling(ledger, current, grace)
    {
        next.metadata.expiry_notice_sent_at = Some(now);
        notices.push(Notice {
            subscription_id: next.id,
            kind: NoticeKind::Expired,
        });
    }

    Ok(Some(Reconciliation {
        writes: vec![next],
        plan,
        notices,
    }))
}

/// Claim the `days_left` warning for an ACTIVE subscription
pub fn apply_warning(
    ledger: &UserLedger,
    subscription_id: Uuid,
    days_left: u32,
    now: OffsetDateTime,
    grace: Duration,
) -> BillingResult<Option<Reconciliation>> {
    let current = ledger
        .get(subscription_id)
        .ok_or_else(|| BillingError::NotFound(format!("subscription {subscription_id}")))?;

    let key = days_left.to_string();
    if !current.is_active() || current.metadata.sent_warnings.contains(&key) {
        return Ok(None);
    }

    let mut next = current.clone();
    next.metadata.sent_warnings.insert(key);
    next.updated_at = now;
    let notice = Notice {
        subscription_id: next.id,
        kind: NoticeKind::ExpiryWarning {
            expires_at: next.current_period_end,
            days_left,
        },
    };

    Ok(Some(Reconciliation::settle(ledger, vec![next], vec![notice], now, grace)))
}
