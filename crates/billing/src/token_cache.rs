//! Cached bearer token for the Play Store API

use std::future::Future;

use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::BillingResult;

/// Refresh once the cached token is this close to expiring
pub const REFRESH_MARGIN: Duration = Duration::minutes(10);

/// A bearer token and the instant it stops being valid
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: OffsetDateTime,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    fn is_fresh(&self, now: OffsetDateTime) -> bool {
        self.expires_at - now > REFRESH_MARGIN
    }
}

/// Holds at most one token. Readers never see a half-written value: the
/// whole `AccessToken` is swapped under the write lock.
///
/// The lock is not held while fetching, so two callers that both find the
/// token stale may both fetch; the later write wins.
#[derive(Debug, Default)]
pub struct AccessTokenCache {
    current: RwLock<Option<AccessToken>>,
}

impl AccessTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached token, or run `fetch` and cache its result
    pub async fn get_or_refresh<F, Fut>(&self, now: OffsetDateTime, fetch: F) -> BillingResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BillingResult<AccessToken>>,
    {
        if let Some(cached) = self.current.read().await.as_ref() {
            if cached.is_fresh(now) {
                return Ok(cached.token.clone());
            }
        }

        debug!("Refreshing store access token");
        let fresh = fetch().await?;
        let token = fresh.token.clone();
        *self.current.write().await = Some(fresh);
        Ok(token)
    }

    /// Drop the cached token so the next call fetches a new one
    pub async fn invalidate(&self) {
        *self.current.write().await = None;
    }
}
