use plansync_billing::{acknowledge, BillingError, SubscriptionStore, WebhookAck, WebhookOutcome};
use plansync_shared::{Platform, PlanTier, SubscriptionStatus};
use time::macros::datetime;
use time::Duration;

use crate::support::*;

#[tokio::test]
async fn test_did_renew_reactivates_fully_expired_subscription() {
    let mut h = harness().await;
    let _keys = mock_keys(&mut h.server).await;
    let user = insert_user(&h.store, PlanTier::Free).await;
    let old_end = datetime!(2026-01-01 0:00 UTC);
    let mut sub = subscription(user.id, Platform::AppStore, "5000000001", SubscriptionStatus::Expired, old_end);
    sub.metadata.grace_period_end = Some(old_end + Duration::days(3));
    sub.metadata.fully_expired_at = Some(old_end + Duration::days(4));
    sub.metadata.expiry_notice_sent_at = Some(old_end + Duration::days(4));
    h.store.insert_subscription(sub.clone()).await;

    let now = datetime!(2026-01-06 0:00 UTC);
    let new_end = datetime!(2026-02-06 0:00 UTC);
    let body = app_store_notification("DID_RENEW", "5000000001", new_end, now);

    let outcome = h.service.webhooks.handle_at(Platform::AppStore, &body, now).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Applied);

    let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Active);
    assert_eq!(stored.current_period_end, new_end);
    assert!(!stored.is_fully_expired());
    assert_eq!(stored.metadata.expiry_notice_sent_at, None);
    assert_eq!(plan_of(&h.store, user.id).await, PlanTier::Pro);

    // Redelivery leaves the same state
    let outcome = h.service.webhooks.handle_at(Platform::AppStore, &body, now).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Applied);
    assert_eq!(h.store.get_subscription(sub.id).await.unwrap().unwrap(), stored);
}

#[tokio::test]
async fn test_did_renew_reactivates_cancelled_subscription() {
    let mut h = harness().await;
    let _keys = mock_keys(&mut h.server).await;
    let user = insert_user(&h.store, PlanTier::Pro).await;
    let old_end = datetime!(2026-01-01 0:00 UTC);
    let mut sub = subscription(user.id, Platform::AppStore, "5000000005", SubscriptionStatus::Cancelled, old_end);
    sub.cancel_at_period_end = true;
    h.store.insert_subscription(sub.clone()).await;

    h.service.lifecycle.run_expiry_sweep(old_end + Duration::hours(1)).await.unwrap();
    assert_eq!(plan_of(&h.store, user.id).await, PlanTier::Free);

    let now = datetime!(2026-01-03 0:00 UTC);
    let new_end = datetime!(2026-02-03 0:00 UTC);
    let body = app_store_notification("DID_RENEW", "5000000005", new_end, now);
    let outcome = h.service.webhooks.handle_at(Platform::AppStore, &body, now).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Applied);

    let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Active);
    assert!(!stored.cancel_at_period_end);
    assert_eq!(stored.current_period_end, new_end);
    assert!(!stored.is_fully_expired());
    assert_eq!(plan_of(&h.store, user.id).await, PlanTier::Pro);
}

#[tokio::test]
async fn test_refund_revokes_access_immediately() {
    let mut h = harness().await;
    let _keys = mock_keys(&mut h.server).await;
    let user = insert_user(&h.store, PlanTier::Pro).await;
    let end = datetime!(2026-02-01 0:00 UTC);
    let sub = subscription(user.id, Platform::AppStore, "5000000002", SubscriptionStatus::Active, end);
    h.store.insert_subscription(sub.clone()).await;

    let now = datetime!(2026-01-10 0:00 UTC);
    let body = app_store_notification("REFUND", "5000000002", end, now);
    h.service.webhooks.handle_at(Platform::AppStore, &body, now).await.unwrap();

    let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Cancelled);
    assert!(!stored.cancel_at_period_end);
    assert_eq!(plan_of(&h.store, user.id).await, PlanTier::Free);
}

#[tokio::test]
async fn test_stale_expiry_does_not_undo_renewal() {
    let mut h = harness().await;
    let _keys = mock_keys(&mut h.server).await;
    let user = insert_user(&h.store, PlanTier::Pro).await;
    let end = datetime!(2026-01-01 0:00 UTC);
    let sub = subscription(user.id, Platform::AppStore, "5000000003", SubscriptionStatus::Active, end);
    h.store.insert_subscription(sub.clone()).await;

    let now = datetime!(2026-01-01 1:00 UTC);
    let renewed_end = datetime!(2026-02-01 0:00 UTC);
    let renewal = app_store_notification("DID_RENEW", "5000000003", renewed_end, now);
    // Sent before the renewal, delivered after it
    let expiry = app_store_notification("EXPIRED", "5000000003", end, now - Duration::minutes(30));

    h.service.webhooks.handle_at(Platform::AppStore, &renewal, now).await.unwrap();
    h.service.webhooks.handle_at(Platform::AppStore, &expiry, now).await.unwrap();

    let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Active);
    assert_eq!(stored.current_period_end, renewed_end);
    assert_eq!(plan_of(&h.store, user.id).await, PlanTier::Pro);
}

#[tokio::test]
async fn test_unknown_subscription_and_ignored_types() {
    let mut h = harness().await;
    let _keys = mock_keys(&mut h.server).await;
    let now = datetime!(2026-01-10 0:00 UTC);

    let body = app_store_notification("DID_RENEW", "never-seen", datetime!(2026-02-10 0:00 UTC), now);
    let result = h.service.webhooks.handle_at(Platform::AppStore, &body, now).await;
    assert_eq!(result.as_ref().unwrap(), &WebhookOutcome::UnknownSubscription);
    assert_eq!(acknowledge(Platform::AppStore, &result), WebhookAck::Acknowledge);

    let body = app_store_notification("PRICE_INCREASE", "never-seen", datetime!(2026-02-10 0:00 UTC), now);
    let outcome = h.service.webhooks.handle_at(Platform::AppStore, &body, now).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Ignored);
    assert_eq!(h.store.subscription_count().await, 0);
}

#[tokio::test]
async fn test_malformed_body_is_acknowledged_not_retried() {
    let h = harness().await;
    let result = h
        .service
        .webhooks
        .handle_at(Platform::AppStore, br#"{"unexpected":true}"#, datetime!(2026-01-10 0:00 UTC))
        .await;

    assert!(matches!(result, Err(BillingError::ReceiptInvalid(_))));
    assert_eq!(acknowledge(Platform::AppStore, &result), WebhookAck::Acknowledge);
}

#[tokio::test]
async fn test_key_endpoint_outage_requests_redelivery() {
    let mut h = harness().await;
    let _keys = h
        .server
        .mock("GET", "/keys")
        .with_status(503)
        .expect(3)
        .create_async()
        .await;
    let now = datetime!(2026-01-10 0:00 UTC);
    let body = app_store_notification("DID_RENEW", "5000000004", datetime!(2026-02-10 0:00 UTC), now);

    let result = h.service.webhooks.handle_at(Platform::AppStore, &body, now).await;

    assert!(matches!(result, Err(BillingError::ServiceUnavailable(_))));
    assert_eq!(acknowledge(Platform::AppStore, &result), WebhookAck::Redeliver);
}

#[tokio::test]
async fn test_play_cancellation_keeps_access_until_period_end() {
    let h = harness().await;
    let user = insert_user(&h.store, PlanTier::Pro).await;
    let end = datetime!(2026-02-01 0:00 UTC);
    let sub = subscription(user.id, Platform::PlayStore, "play-token-9", SubscriptionStatus::Active, end);
    h.store.insert_subscription(sub.clone()).await;

    let now = datetime!(2026-01-10 0:00 UTC);
    let body = play_push(3, "play-token-9", "pro_monthly_subscription", now);
    let outcome = h.service.webhooks.handle_at(Platform::PlayStore, &body, now).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Applied);

    let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Cancelled);
    assert!(stored.cancel_at_period_end);
    assert_eq!(plan_of(&h.store, user.id).await, PlanTier::Pro);
}

#[tokio::test]
async fn test_play_renewal_reads_expiry_from_store() {
    let mut h = harness().await;
    let user = insert_user(&h.store, PlanTier::Pro).await;
    let end = datetime!(2026-01-01 0:00 UTC);
    let sub = subscription(user.id, Platform::PlayStore, "play-token-10", SubscriptionStatus::Active, end);
    h.store.insert_subscription(sub.clone()).await;

    let renewed_end = datetime!(2026-02-01 0:00 UTC);
    let _token = mock_play_token(&mut h.server).await;
    let status = mock_play_subscription(&mut h.server, "play-token-10", "pro_monthly_subscription", renewed_end)
        .await
        .expect(1);

    let now = datetime!(2026-01-01 0:05 UTC);
    let body = play_push(2, "play-token-10", "pro_monthly_subscription", now);
    h.service.webhooks.handle_at(Platform::PlayStore, &body, now).await.unwrap();

    status.assert_async().await;
    let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.current_period_end, renewed_end);
    assert_eq!(stored.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn test_play_renewal_reactivates_cancelled_subscription() {
    let mut h = harness().await;
    let user = insert_user(&h.store, PlanTier::Pro).await;
    let end = datetime!(2026-01-01 0:00 UTC);
    let mut sub = subscription(user.id, Platform::PlayStore, "play-token-12", SubscriptionStatus::Cancelled, end);
    sub.cancel_at_period_end = true;
    h.store.insert_subscription(sub.clone()).await;

    let renewed_end = datetime!(2026-02-01 0:00 UTC);
    let _token = mock_play_token(&mut h.server).await;
    let _status = mock_play_subscription(&mut h.server, "play-token-12", "pro_monthly_subscription", renewed_end).await;

    let now = datetime!(2025-12-31 0:00 UTC);
    let body = play_push(2, "play-token-12", "pro_monthly_subscription", now);
    let outcome = h.service.webhooks.handle_at(Platform::PlayStore, &body, now).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Applied);

    let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Active);
    assert!(!stored.cancel_at_period_end);
    assert_eq!(stored.current_period_end, renewed_end);
    assert_eq!(plan_of(&h.store, user.id).await, PlanTier::Pro);
}

#[tokio::test]
async fn test_play_expired_notification() {
    let h = harness().await;
    let user = insert_user(&h.store, PlanTier::Pro).await;
    let end = datetime!(2026-01-01 0:00 UTC);
    let sub = subscription(user.id, Platform::PlayStore, "play-token-11", SubscriptionStatus::Active, end);
    h.store.insert_subscription(sub.clone()).await;

    let now = datetime!(2026-01-01 0:10 UTC);
    let body = play_push(13, "play-token-11", "pro_monthly_subscription", now);
    h.service.webhooks.handle_at(Platform::PlayStore, &body, now).await.unwrap();

    let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Expired);
    // Still inside the grace window
    assert_eq!(plan_of(&h.store, user.id).await, PlanTier::Pro);
}
