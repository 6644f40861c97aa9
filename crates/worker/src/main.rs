//! PlanSync Background Worker
//!
//! Handles scheduled jobs:
//! - Expiry sweep: lapsed subscriptions into grace, then to free (hourly)
//! - Expiry warnings 7/3/1 days ahead (daily at 09:00 UTC)
//! - Heartbeat (every 5 minutes)

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

mod jobs;

use std::sync::Arc;

use anyhow::Context;
use plansync_billing::BillingService;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::jobs::{run_sweep, OverlapGuard, Sweep};

const DEFAULT_EXPIRY_SWEEP_CRON: &str = "0 0 * * * *";
const DEFAULT_WARNING_SWEEP_CRON: &str = "0 0 9 * * *";

static EXPIRY_GUARD: OverlapGuard = OverlapGuard::new("expiry_sweep");
static WARNING_GUARD: OverlapGuard = OverlapGuard::new("warning_sweep");

fn required_env(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("{name} must be set"))
}

fn cron_from_env(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn sweep_job(cron: &str, billing: Arc<BillingService>, guard: &'static OverlapGuard, sweep: Sweep) -> anyhow::Result<Job> {
    Ok(Job::new_async(cron, move |_uuid, _l| {
        let billing = billing.clone();
        Box::pin(async move {
            run_sweep(&billing, guard, sweep).await;
        })
    })?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting PlanSync Worker");

    let database_url = required_env("DATABASE_URL")?;
    let pool = plansync_shared::create_pool(&database_url, 5)
        .await
        .context("failed to connect to database")?;
    info!("Database pool created");

    plansync_shared::run_migrations(&pool)
        .await
        .context("failed to run migrations")?;
    info!("Migrations applied");

    let billing = Arc::new(BillingService::from_env(pool)?);

    let mut scheduler = JobScheduler::new().await?;

    let expiry_cron = cron_from_env("EXPIRY_SWEEP_CRON", DEFAULT_EXPIRY_SWEEP_CRON);
    scheduler
        .add(sweep_job(&expiry_cron, billing.clone(), &EXPIRY_GUARD, Sweep::Expiry)?)
        .await?;
    info!(cron = %expiry_cron, "Scheduled: Expiry sweep");

    let warning_cron = cron_from_env("WARNING_SWEEP_CRON", DEFAULT_WARNING_SWEEP_CRON);
    scheduler
        .add(sweep_job(&warning_cron, billing.clone(), &WARNING_GUARD, Sweep::Warning)?)
        .await?;
    info!(cron = %warning_cron, "Scheduled: Expiry warning sweep");

    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("PlanSync Worker started successfully with 3 scheduled jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    scheduler.shutdown().await?;
    Ok(())
}
