//! Sweep jobs run by the scheduler

use std::sync::atomic::{AtomicBool, Ordering};

use plansync_billing::{BillingService, SweepSummary};
use time::OffsetDateTime;
use tracing::{error, info, warn};

/// Skips a tick while the previous run of the same sweep is still going
#[derive(Debug)]
pub struct OverlapGuard {
    name: &'static str,
    running: AtomicBool,
}

/// Clears the guard when dropped
pub struct RunToken<'a> {
    guard: &'a OverlapGuard,
}

impl Drop for RunToken<'_> {
    fn drop(&mut self) {
        self.guard.running.store(false, Ordering::Release);
    }
}

impl OverlapGuard {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            running: AtomicBool::new(false),
        }
    }

    pub fn try_start(&self) -> Option<RunToken<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RunToken { guard: self })
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Sweep {
    Expiry,
    Warning,
}

/// Run one sweep unless the previous run is still in progress
pub async fn run_sweep(
    billing: &BillingService,
    guard: &OverlapGuard,
    sweep: Sweep,
) -> Option<SweepSummary> {
    let Some(_token) = guard.try_start() else {
        warn!(job = guard.name, "Previous run still in progress - skipping tick");
        return None;
    };

    let now = OffsetDateTime::now_utc();
    info!(job = guard.name, "Running scheduled sweep");
    let result = match sweep {
        Sweep::Expiry => billing.lifecycle.run_expiry_sweep(now).await,
        Sweep::Warning => billing.lifecycle.run_warning_sweep(now).await,
    };

    match result {
        Ok(summary) => {
            if summary.errors > 0 {
                warn!(job = guard.name, errors = summary.errors, "Sweep finished with row errors");
            }
            Some(summary)
        }
        Err(e) => {
            error!(job = guard.name, error = %e, "Sweep failed to start");
            None
        }
    }
}
