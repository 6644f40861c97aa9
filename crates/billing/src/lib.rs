//! PlanSync Entitlements
//!
//! Keeps each user's plan tier in line with what the App Store and Play Store
//! say they paid for: receipt validation, store webhooks, expiry and warning
//! sweeps, and quota enforcement, all writing through one state machine.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod app_store;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod notifications;
pub mod play_store;
pub mod products;
pub mod quota;
pub mod receipts;
pub mod store;
pub mod subscriptions;
pub mod token_cache;
pub mod webhooks;

use std::sync::Arc;

use sqlx::PgPool;

pub use app_store::AppStoreClient;
pub use config::BillingConfig;
pub use entitlement::{EntitlementState, EntitlementStatus};
pub use error::{BillingError, BillingResult};
pub use lifecycle::{LifecycleScheduler, SweepSummary};
pub use notifications::{BillingEmailService, Notifier};
pub use play_store::PlayStoreClient;
pub use quota::{QuotaDecision, QuotaEnforcer};
pub use receipts::{ReceiptSubmission, ReceiptValidator};
pub use store::{MemorySubscriptionStore, PgSubscriptionStore, SubscriptionStore};
pub use subscriptions::SubscriptionService;
pub use webhooks::{acknowledge, WebhookAck, WebhookOutcome, WebhookProcessor};

use crate::http::StoreHttp;
use crate::token_cache::AccessTokenCache;

/// Main entitlement service combining all components
#[derive(Clone)]
pub struct BillingService {
    pub receipts: ReceiptValidator,
    pub webhooks: WebhookProcessor,
    pub subscriptions: SubscriptionService,
    pub lifecycle: LifecycleScheduler,
    pub quota: QuotaEnforcer,
}

impl BillingService {
    /// Wire every component to one store and one notifier
    pub fn new(
        config: BillingConfig,
        store: Arc<dyn SubscriptionStore>,
        notifier: Arc<dyn Notifier>,
    ) -> BillingResult<Self> {
        let http = StoreHttp::new(config.retry.clone())?;
        let app_store = AppStoreClient::new(config.app_store, http.clone());
        let play_store = PlayStoreClient::new(
            config.play_store,
            http,
            Arc::new(AccessTokenCache::new()),
        );
        let grace = config.lifecycle.grace_period;

        Ok(Self {
            receipts: ReceiptValidator::new(store.clone(), app_store.clone(), play_store.clone(), grace),
            webhooks: WebhookProcessor::new(store.clone(), app_store, play_store, grace),
            subscriptions: SubscriptionService::new(store.clone(), grace),
            lifecycle: LifecycleScheduler::new(store.clone(), notifier, config.lifecycle),
            quota: QuotaEnforcer::new(store),
        })
    }

    /// Postgres-backed service with email notices, configured from the environment
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        Self::new(
            config,
            Arc::new(PgSubscriptionStore::new(pool)),
            Arc::new(BillingEmailService::from_env()?),
        )
    }
}
