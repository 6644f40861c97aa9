//! Expiry and warning sweeps
//!
//! Both sweeps are forward-only and idempotent: every transition and notice
//! is claimed in the subscription's metadata inside the same transaction, so
//! re-running a sweep (or two overlapping runs) sends nothing twice. Each row
//! is handled on its own; one failure is logged and counted and the sweep
//! moves on.

use std::sync::Arc;

use plansync_shared::Subscription;
use time::{Duration, OffsetDateTime, Time, UtcOffset};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::LifecycleConfig;
use crate::entitlement::{apply_expiry_sweep, apply_warning, UserLedger};
use crate::error::BillingResult;
use crate::notifications::{dispatch, Notifier};
use crate::store::SubscriptionStore;

/// Counts from one sweep run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Rows considered
    pub examined: usize,
    /// Rows that changed
    pub transitioned: usize,
    /// Notices delivered
    pub notices_sent: usize,
    /// Rows that failed
    pub errors: usize,
}

#[derive(Clone)]
pub struct LifecycleScheduler {
    store: Arc<dyn SubscriptionStore>,
    notifier: Arc<dyn Notifier>,
    config: LifecycleConfig,
}

/// Start of the UTC calendar day containing `now`
fn start_of_day(now: OffsetDateTime) -> OffsetDateTime {
    now.to_offset(UtcOffset::UTC).replace_time(Time::MIDNIGHT)
}

/// `[start, end)` covering the calendar day `days` days after `now`
pub fn warning_window(now: OffsetDateTime, days: u32) -> (OffsetDateTime, OffsetDateTime) {
    let start = start_of_day(now) + Duration::days(i64::from(days));
    (start, start + Duration::days(1))
}

impl LifecycleScheduler {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        notifier: Arc<dyn Notifier>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    /// Move every lapsed subscription into its grace window or past it
    pub async fn run_expiry_sweep(&self, now: OffsetDateTime) -> BillingResult<SweepSummary> {
        let candidates = self.store.expiry_candidates(now).await?;
        let mut summary = SweepSummary::default();

        for subscription in &candidates {
            summary.examined += 1;
            let grace = self.config.grace_period;
            let decide = |ledger: &UserLedger| apply_expiry_sweep(ledger, subscription.id, now, grace);
            self.apply(subscription, &decide, &mut summary).await;
        }

        info!(
            examined = summary.examined,
            transitioned = summary.transitioned,
            notices_sent = summary.notices_sent,
            errors = summary.errors,
            "Expiry sweep complete"
        );
        Ok(summary)
    }

    /// Send each configured pre-expiry warning once per billing period
    pub async fn run_warning_sweep(&self, now: OffsetDateTime) -> BillingResult<SweepSummary> {
        let mut summary = SweepSummary::default();

        for &days_left in &self.config.warning_days {
            let (start, end) = warning_window(now, days_left);
            let expiring = match self.store.expiring_between(start, end).await {
                Ok(rows) => rows,
                Err(e) => {
                    error!(days_left, error = %e, "Failed to load expiring subscriptions");
                    summary.errors += 1;
                    continue;
                }
            };

            for subscription in &expiring {
                summary.examined += 1;
                let grace = self.config.grace_period;
                let decide =
                    |ledger: &UserLedger| apply_warning(ledger, subscription.id, days_left, now, grace);
                self.apply(subscription, &decide, &mut summary).await;
            }
        }

        info!(
            examined = summary.examined,
            transitioned = summary.transitioned,
            notices_sent = summary.notices_sent,
            errors = summary.errors,
            "Expiry warning sweep complete"
        );
        Ok(summary)
    }

    async fn apply(
        &self,
        subscription: &Subscription,
        decide: &crate::store::Decide<'_>,
        summary: &mut SweepSummary,
    ) {
        match self.store.reconcile(subscription.user_id, decide).await {
            Ok(Some(outcome)) => {
                summary.transitioned += 1;
                summary.notices_sent += dispatch(self.notifier.as_ref(), &outcome.user, &outcome.notices).await;
                log_transition(subscription.id, &outcome.written);
            }
            Ok(None) => {}
            Err(e) => {
                summary.errors += 1;
                error!(
                    subscription_id = %subscription.id,
                    user_id = %subscription.user_id,
                    error = %e,
                    "Sweep failed for subscription"
                );
            }
        }
    }
}

fn log_transition(subscription_id: Uuid, written: &[Subscription]) {
    if let Some(row) = written.iter().find(|s| s.id == subscription_id) {
        info!(
            subscription_id = %row.id,
            user_id = %row.user_id,
            status = %row.status,
            fully_expired = row.is_fully_expired(),
            "Subscription advanced by sweep"
        );
    }
}
