//! Postgres-backed store

use std::collections::BTreeMap;

use async_trait::async_trait;
use plansync_shared::{
    Platform, PlanTier, ResourceKind, Subscription, SubscriptionMetadata, SubscriptionStatus,
    UserAccount,
};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::{Decide, DecideQuota, ReconcileOutcome, SubscriptionStore};
use crate::entitlement::UserLedger;
use crate::error::{BillingError, BillingResult};
use crate::quota::QuotaDecision;

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan, status, platform, external_id, product_id, \
     current_period_end, cancel_at_period_end, metadata, created_at, updated_at";

struct SubscriptionRow(Subscription);

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for SubscriptionRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let metadata: Json<SubscriptionMetadata> = row.try_get("metadata")?;
        Ok(Self(Subscription {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            plan: row.try_get::<PlanTier, _>("plan")?,
            status: row.try_get::<SubscriptionStatus, _>("status")?,
            platform: row.try_get::<Platform, _>("platform")?,
            external_id: row.try_get("external_id")?,
            product_id: row.try_get("product_id")?,
            current_period_end: row.try_get("current_period_end")?,
            cancel_at_period_end: row.try_get("cancel_at_period_end")?,
            metadata: metadata.0,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }
}

fn unwrap_rows(rows: Vec<SubscriptionRow>) -> Vec<Subscription> {
    rows.into_iter().map(|r| r.0).collect()
}

/// Production store over the `users`, `subscriptions` and `resource_usage` tables
#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn upsert(tx: &mut Transaction<'_, Postgres>, row: &Subscription) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, user_id, plan, status, platform, external_id, product_id,
                current_period_end, cancel_at_period_end, metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                plan = EXCLUDED.plan,
                status = EXCLUDED.status,
                product_id = EXCLUDED.product_id,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(row.id)
        .bind(row.user_id)
        .bind(row.plan)
        .bind(row.status)
        .bind(row.platform)
        .bind(&row.external_id)
        .bind(&row.product_id)
        .bind(row.current_period_end)
        .bind(row.cancel_at_period_end)
        .bind(Json(&row.metadata))
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<UserAccount>> {
        let row: Option<(Uuid, String, PlanTier)> =
            sqlx::query_as("SELECT id, email, plan FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, email, plan)| UserAccount { id, email, plan }))
    }

    async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<Option<Subscription>> {
        let sql = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1");
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    async fn find_by_external_id(
        &self,
        platform: Platform,
        external_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE platform = $1 AND external_id = $2"
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(platform)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    async fn list_subscriptions(&self, user_id: Uuid) -> BillingResult<Vec<Subscription>> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE user_id = $1 \
             ORDER BY created_at DESC, id DESC"
        );
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(unwrap_rows(rows))
    }

    async fn expiry_candidates(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>> {
        let sql = format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE current_period_end <= $1
              AND metadata->>'fullyExpiredAt' IS NULL
              AND (status IN ('active', 'expired')
                   OR (status = 'cancelled' AND cancel_at_period_end))
            ORDER BY current_period_end ASC
            "#
        );
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        Ok(unwrap_rows(rows))
    }

    async fn expiring_between(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let sql = format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE status = 'active'
              AND current_period_end >= $1
              AND current_period_end < $2
            ORDER BY current_period_end ASC
            "#
        );
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        Ok(unwrap_rows(rows))
    }

    async fn resource_usage(&self, user_id: Uuid) -> BillingResult<BTreeMap<ResourceKind, u32>> {
        let rows: Vec<(ResourceKind, i32)> =
            sqlx::query_as("SELECT kind, used FROM resource_usage WHERE user_id = $1")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(kind, used)| (kind, u32::try_from(used).unwrap_or(0)))
            .collect())
    }

    async fn reconcile(
        &self,
        user_id: Uuid,
        decide: &Decide<'_>,
    ) -> BillingResult<Option<ReconcileOutcome>> {
        let mut tx = self.pool.begin().await?;

        // Lock the user row first; every writer for this user queues here
        let user: Option<(Uuid, String, PlanTier)> =
            sqlx::query_as("SELECT id, email, plan FROM users WHERE id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
        let (id, email, plan) =
            user.ok_or_else(|| BillingError::NotFound(format!("user {user_id}")))?;

        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE user_id = $1 \
             ORDER BY created_at DESC, id DESC FOR UPDATE"
        );
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_all(&mut *tx)
            .await?;

        let ledger = UserLedger {
            user: UserAccount { id, email, plan },
            subscriptions: unwrap_rows(rows),
        };

        let Some(reconciliation) = decide(&ledger)? else {
            // Nothing to write; dropping the transaction releases the locks
            return Ok(None);
        };

        for row in &reconciliation.writes {
            if row.user_id != user_id {
                return Err(BillingError::Internal(format!(
                    "subscription {} does not belong to user {user_id}",
                    row.id
                )));
            }
            Self::upsert(&mut tx, row).await?;
        }

        sqlx::query("UPDATE users SET plan = $2, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(reconciliation.plan)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(
            user_id = %user_id,
            written = reconciliation.writes.len(),
            plan = %reconciliation.plan,
            "Reconciliation committed"
        );

        Ok(Some(ReconcileOutcome {
            user: UserAccount {
                plan: reconciliation.plan,
                ..ledger.user
            },
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
        let mut tx = self.pool.begin().await?;

        let plan: Option<PlanTier> =
            sqlx::query_scalar("SELECT plan FROM users WHERE id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
        let plan = plan.ok_or_else(|| BillingError::NotFound(format!("user {user_id}")))?;

        sqlx::query(
            r#"
            INSERT INTO resource_usage (user_id, kind, used)
            VALUES ($1, $2, 0)
            ON CONFLICT (user_id, kind) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(kind)
        .execute(&mut *tx)
        .await?;

        let used: i32 = sqlx::query_scalar(
            "SELECT used FROM resource_usage WHERE user_id = $1 AND kind = $2 FOR UPDATE",
        )
        .bind(user_id)
        .bind(kind)
        .fetch_one(&mut *tx)
        .await?;

        let decision = decide(plan, u32::try_from(used).unwrap_or(0));
        if decision.is_reserved() {
            sqlx::query(
                r#"
                UPDATE resource_usage
                SET used = used + 1, updated_at = NOW()
                WHERE user_id = $1 AND kind = $2
                "#,
            )
            .bind(user_id)
            .bind(kind)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(decision)
    }

    async fn release(&self, user_id: Uuid, kind: ResourceKind) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE resource_usage
            SET used = GREATEST(used - 1, 0), updated_at = NOW()
            WHERE user_id = $1 AND kind = $2
            "#,
        )
        .bind(user_id)
        .bind(kind)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
