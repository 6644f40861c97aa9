//! Subscription lifecycle notifications
//!
//! Sends transactional emails via Resend API when a subscription enters its
//! grace window, fully expires, or is about to expire.

use std::time::Duration;

use async_trait::async_trait;
use plansync_shared::UserAccount;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::entitlement::{Notice, NoticeKind};
use crate::error::{BillingError, BillingResult};

const RESEND_URL: &str = "https://api.resend.com/emails";
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound user notifications.
///
/// Implementations return `Ok(true)` when the message was handed off,
/// `Ok(false)` when it was skipped or refused. Callers never roll back a
/// state transition because a notice failed.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_grace_period_notice(
        &self,
        user: &UserAccount,
        grace_end: OffsetDateTime,
    ) -> BillingResult<bool>;

    async fn send_expiry_notice(&self, user: &UserAccount) -> BillingResult<bool>;

    async fn send_expiry_warning(
        &self,
        user: &UserAccount,
        expires_at: OffsetDateTime,
        days_left: u32,
    ) -> BillingResult<bool>;
}

/// Send every claimed notice for `user`. Returns how many were delivered.
pub async fn dispatch(notifier: &dyn Notifier, user: &UserAccount, notices: &[Notice]) -> usize {
    let mut delivered = 0;
    for notice in notices {
        let result = match &notice.kind {
            NoticeKind::GracePeriod { grace_end } => {
                notifier.send_grace_period_notice(user, *grace_end).await
            }
            NoticeKind::Expired => notifier.send_expiry_notice(user).await,
            NoticeKind::ExpiryWarning {
                expires_at,
                days_left,
            } => notifier.send_expiry_warning(user, *expires_at, *days_left).await,
        };

        match result {
            Ok(true) => delivered += 1,
            Ok(false) => warn!(
                user_id = %user.id,
                subscription_id = %notice.subscription_id,
                notice = ?notice.kind,
                "Notice was not delivered"
            ),
            Err(e) => error!(
                user_id = %user.id,
                subscription_id = %notice.subscription_id,
                error = %e,
                "Failed to send notice - non-fatal"
            ),
        }
    }
    delivered
}

/// Email configuration
#[derive(Clone)]
pub struct EmailConfig {
    /// Resend API key
    pub resend_api_key: String,
    /// From address for emails
    pub email_from: String,
    /// App name for branding
    pub app_name: String,
    pub support_email: String,
    /// Where the "manage subscription" links point
    pub dashboard_url: String,
    /// Resend endpoint
    pub api_url: String,
    /// Upper bound on one send, connect included
    pub send_timeout: Duration,
}

impl std::fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailConfig")
            .field("enabled", &self.is_enabled())
            .field("email_from", &self.email_from)
            .field("app_name", &self.app_name)
            .finish_non_exhaustive()
    }
}

impl EmailConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "PlanSync <noreply@plansync.app>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "PlanSync".to_string()),
            support_email: std::env::var("SUPPORT_EMAIL")
                .unwrap_or_else(|_| "support@plansync.app".to_string()),
            dashboard_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "https://plansync.app".to_string()),
            api_url: std::env::var("RESEND_API_URL").unwrap_or_else(|_| RESEND_URL.to_string()),
            send_timeout: std::env::var("EMAIL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_SEND_TIMEOUT),
        }
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        !self.resend_api_key.is_empty()
    }
}

/// Email-backed [`Notifier`]
#[derive(Clone)]
pub struct BillingEmailService {
    config: EmailConfig,
    client: reqwest::Client,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> BillingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.send_timeout)
            .connect_timeout(config.send_timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("failed to build email client: {e}")))?;
        Ok(Self { config, client })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(EmailConfig::from_env())
    }

    /// Send an email via Resend API.
    ///
    /// Delivery problems come back as `Ok(false)`; nothing here fails the
    /// sweep or webhook that triggered the email.
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> BillingResult<bool> {
        if !self.config.is_enabled() {
            warn!(to = %to, subject = %subject, "Email not configured, skipping");
            return Ok(false);
        }

        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": [to],
            "subject": subject,
            "html": html
        });

        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.resend_api_key)
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                info!(to = %to, subject = %subject, "Subscription email sent");
                Ok(true)
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                error!(
                    to = %to,
                    subject = %subject,
                    status = %status,
                    body = %body,
                    "Failed to send subscription email - non-fatal"
                );
                Ok(false)
            }
            Err(e) => {
                error!(
                    to = %to,
                    subject = %subject,
                    error = %e,
                    "Failed to send subscription email - non-fatal"
                );
                Ok(false)
            }
        }
    }

    /// Wrap `content` in the shared email layout
    fn render(&self, heading: &str, accent: &str, content: &str) -> String {
        let manage_link = format!("{}/account/subscription", self.config.dashboard_url);
        format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2 style="color: {accent};">{heading}</h2>
    <p>Hi there,</p>
    {content}
    <p>
        <a href="{manage_link}" style="display: inline-block; padding: 12px 24px; background-color: #6366f1; color: white; text-decoration: none; border-radius: 6px; font-weight: bold;">
            Manage Subscription
        </a>
    </p>
    <p style="color: #666; font-size: 14px;">
        If you have any questions, please contact us at <a href="mailto:{support_email}">{support_email}</a>
    </p>
    <hr style="border: none; border-top: 1px solid #eee; margin: 20px 0;">
    <p style="color: #999; font-size: 12px;">{app_name}</p>
</body>
</html>"#,
            support_email = self.config.support_email,
            app_name = self.config.app_name,
        )
    }
}

fn format_date(at: OffsetDateTime) -> String {
    format!("{} {}, {}", at.month(), at.day(), at.year())
}

#[async_trait]
impl Notifier for BillingEmailService {
    async fn send_grace_period_notice(
        &self,
        user: &UserAccount,
        grace_end: OffsetDateTime,
    ) -> BillingResult<bool> {
        let content = format!(
            r#"<p>We couldn't confirm the renewal of your <strong>{plan}</strong> subscription.</p>
    <p>Your access continues until <strong>{date}</strong>. Renew from your device's subscription settings to avoid losing your plan.</p>"#,
            plan = user.plan,
            date = format_date(grace_end),
        );
        let html = self.render("Your Subscription Has Lapsed", "#d97706", &content);
        self.send_email(
            &user.email,
            &format!("Action Needed: Renew Your Subscription - {}", self.config.app_name),
            &html,
        )
        .await
    }

    async fn send_expiry_notice(&self, user: &UserAccount) -> BillingResult<bool> {
        let content = r#"<p>Your subscription has expired and your account is now on the <strong>Free</strong> plan.</p>
    <p>Your data is safe. Subscribe again at any time to restore your limits.</p>"#;
        let html = self.render("Subscription Expired", "#dc2626", content);
        self.send_email(
            &user.email,
            &format!("Your Subscription Has Expired - {}", self.config.app_name),
            &html,
        )
        .await
    }

    async fn send_expiry_warning(
        &self,
        user: &UserAccount,
        expires_at: OffsetDateTime,
        days_left: u32,
    ) -> BillingResult<bool> {
        let days = if days_left == 1 {
            "1 day".to_string()
        } else {
            format!("{days_left} days")
        };
        let content = format!(
            r#"<p>Your <strong>{plan}</strong> subscription expires in <strong>{days}</strong>, on {date}.</p>
    <p>If auto-renew is off, turn it back on to keep your plan.</p>"#,
            plan = user.plan,
            date = format_date(expires_at),
        );
        let html = self.render("Subscription Expiring Soon", "#6366f1", &content);
        self.send_email(
            &user.email,
            &format!("Your Subscription Expires in {days} - {}", self.config.app_name),
            &html,
        )
        .await
    }
}
