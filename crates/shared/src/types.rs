//! Common types used across PlanSync

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::TypeError;

/// Sentinel limit meaning "no check" for unlimited tiers
pub const UNLIMITED: u32 = u32::MAX;

// =============================================================================
// Enums
// =============================================================================

/// Plan tier a user is entitled to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Pro,
    Enterprise,
}

impl Default for PlanTier {
    fn default() -> Self {
        Self::Free
    }
}

impl PlanTier {
    /// Maximum number of resources of `kind` a user on this tier may own.
    /// Free (1 project, 10 documents) → Pro (25, 1000) → Enterprise (Unlimited)
    pub fn limit_for(&self, kind: ResourceKind) -> u32 {
        match (self, kind) {
            (Self::Free, ResourceKind::Project) => 1,
            (Self::Free, ResourceKind::Document) => 10,
            (Self::Pro, ResourceKind::Project) => 25,
            (Self::Pro, ResourceKind::Document) => 1_000,
            (Self::Enterprise, _) => UNLIMITED,
        }
    }

    /// Whether this tier is a paid tier
    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Free)
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Pro => write!(f, "pro"),
            Self::Enterprise => write!(f, "enterprise"),
        }
    }
}

impl std::str::FromStr for PlanTier {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            _ => Err(TypeError::invalid("plan tier", s)),
        }
    }
}

/// Subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Cancelled,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Expired => write!(f, "expired"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Mobile store that issued a purchase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Apple App Store
    AppStore,
    /// Google Play Store
    PlayStore,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AppStore => write!(f, "app_store"),
            Self::PlayStore => write!(f, "play_store"),
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "app_store" | "apple" | "ios" => Ok(Self::AppStore),
            "play_store" | "google" | "android" => Ok(Self::PlayStore),
            _ => Err(TypeError::invalid("platform", s)),
        }
    }
}

/// Billing period of a store product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingPeriod {
    Monthly,
    Yearly,
}

impl std::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Monthly => write!(f, "monthly"),
            Self::Yearly => write!(f, "yearly"),
        }
    }
}

/// Quota-gated resource kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Project,
    Document,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Project, ResourceKind::Document];
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Project => write!(f, "project"),
            Self::Document => write!(f, "document"),
        }
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "project" => Ok(Self::Project),
            "document" => Ok(Self::Document),
            _ => Err(TypeError::invalid("resource kind", s)),
        }
    }
}

// =============================================================================
// Models
// =============================================================================

/// User account as seen by the entitlement subsystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: Uuid,
    pub email: String,
    pub plan: PlanTier,
}

/// Free-form per-subscription bookkeeping, persisted as a JSON blob.
///
/// Every field is optional so rows written by older code still decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionMetadata {
    #[serde(with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub last_validated_at: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_transaction_id: Option<String>,
    /// Warning thresholds (in days) already notified for the current period
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub sent_warnings: BTreeSet<String>,
    #[serde(with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub grace_period_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub grace_notice_sent_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub fully_expired_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub expiry_notice_sent_at: Option<OffsetDateTime>,
    /// Event time of the last store notification applied to this row
    #[serde(with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
}

impl SubscriptionMetadata {
    /// Forget everything tied to the previous billing period
    pub fn reset_period_markers(&mut self) {
        self.sent_warnings.clear();
        self.grace_period_end = None;
        self.grace_notice_sent_at = None;
        self.fully_expired_at = None;
        self.expiry_notice_sent_at = None;
    }
}

/// Subscription model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan: PlanTier,
    pub status: SubscriptionStatus,
    pub platform: Platform,
    /// The store's stable purchase identifier (deduplication key)
    pub external_id: String,
    pub product_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub metadata: SubscriptionMetadata,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Whether the full-expiry downgrade has already happened for this row
    pub fn is_fully_expired(&self) -> bool {
        self.metadata.fully_expired_at.is_some()
    }
}

/// Per-kind resource usage against the current plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub kind: ResourceKind,
    pub used: u32,
    /// `None` when the tier is unlimited
    pub limit: Option<u32>,
    /// `None` when the tier is unlimited
    pub remaining: Option<u32>,
}
