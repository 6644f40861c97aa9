use plansync_billing::{EntitlementState, ReceiptSubmission, SubscriptionStore, SweepSummary};
use plansync_shared::{Platform, PlanTier, SubscriptionStatus};
use time::macros::datetime;
use time::Duration;

use crate::support::*;

#[tokio::test]
async fn test_grace_then_full_expiry_each_notice_once() {
    let h = harness().await;
    let user = insert_user(&h.store, PlanTier::Pro).await;
    let period_end = datetime!(2026-01-01 0:00 UTC);
    let sub = subscription(user.id, Platform::AppStore, "4000000001", SubscriptionStatus::Active, period_end);
    h.store.insert_subscription(sub.clone()).await;
    let lifecycle = &h.service.lifecycle;

    // T+1: into grace, user keeps the plan
    let summary = lifecycle.run_expiry_sweep(period_end + Duration::days(1)).await.unwrap();
    assert_eq!(
        summary,
        SweepSummary {
            examined: 1,
            transitioned: 1,
            notices_sent: 1,
            errors: 0
        }
    );
    let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Expired);
    assert_eq!(stored.metadata.grace_period_end, Some(period_end + Duration::days(3)));
    assert_eq!(plan_of(&h.store, user.id).await, PlanTier::Pro);
    let status = h
        .service
        .subscriptions
        .get_status_at(user.id, period_end + Duration::days(1))
        .await
        .unwrap();
    assert_eq!(status.state, EntitlementState::PastDueGrace);

    // Same day again: nothing new
    let summary = lifecycle.run_expiry_sweep(period_end + Duration::days(1)).await.unwrap();
    assert_eq!(summary.transitioned, 0);
    assert_eq!(summary.notices_sent, 0);

    // T+4: past grace, plan drops to free
    let summary = lifecycle.run_expiry_sweep(period_end + Duration::days(4)).await.unwrap();
    assert_eq!(summary.transitioned, 1);
    assert_eq!(summary.notices_sent, 1);
    let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
    assert!(stored.is_fully_expired());
    assert_eq!(plan_of(&h.store, user.id).await, PlanTier::Free);

    // T+5: the row is no longer a candidate
    let summary = lifecycle.run_expiry_sweep(period_end + Duration::days(5)).await.unwrap();
    assert_eq!(summary.examined, 0);

    assert_eq!(
        h.notifier.sent(),
        vec![
            Sent::GracePeriod {
                user_id: user.id,
                grace_end: period_end + Duration::days(3)
            },
            Sent::Expired { user_id: user.id },
        ]
    );
}

#[tokio::test]
async fn test_first_sweep_after_grace_sends_only_expiry_notice() {
    let h = harness().await;
    let user = insert_user(&h.store, PlanTier::Pro).await;
    let period_end = datetime!(2026-01-01 0:00 UTC);
    let sub = subscription(user.id, Platform::PlayStore, "token-late", SubscriptionStatus::Active, period_end);
    h.store.insert_subscription(sub).await;

    h.service
        .lifecycle
        .run_expiry_sweep(period_end + Duration::days(10))
        .await
        .unwrap();

    assert_eq!(h.notifier.sent(), vec![Sent::Expired { user_id: user.id }]);
    assert_eq!(plan_of(&h.store, user.id).await, PlanTier::Free);
}

#[tokio::test]
async fn test_cancelled_subscription_expires_without_grace() {
    let h = harness().await;
    let user = insert_user(&h.store, PlanTier::Pro).await;
    let period_end = datetime!(2026-01-01 0:00 UTC);
    let mut sub = subscription(user.id, Platform::AppStore, "4000000002", SubscriptionStatus::Cancelled, period_end);
    sub.cancel_at_period_end = true;
    h.store.insert_subscription(sub.clone()).await;

    // Before the period end the cancelled row still grants the plan
    let summary = h
        .service
        .lifecycle
        .run_expiry_sweep(period_end - Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(summary.examined, 0);

    h.service
        .lifecycle
        .run_expiry_sweep(period_end + Duration::hours(1))
        .await
        .unwrap();

    let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Cancelled);
    assert!(stored.is_fully_expired());
    assert_eq!(plan_of(&h.store, user.id).await, PlanTier::Free);
    assert_eq!(h.notifier.sent(), vec![Sent::Expired { user_id: user.id }]);
}

fn app_store_receipt<'a>(product_id: &'a str, receipt: &'a str) -> ReceiptSubmission<'a> {
    ReceiptSubmission {
        platform: Platform::AppStore,
        product_id,
        receipt,
        client_transaction_id: None,
    }
}

#[tokio::test]
async fn test_no_expiry_notice_while_another_plan_entitles() {
    let mut h = harness().await;
    let _keys = mock_keys(&mut h.server).await;
    let user = insert_user(&h.store, PlanTier::Pro).await;
    let old_end = datetime!(2026-01-01 0:00 UTC);
    let mut pro = subscription(user.id, Platform::AppStore, "4000000010", SubscriptionStatus::Cancelled, old_end);
    pro.cancel_at_period_end = true;
    h.store.insert_subscription(pro.clone()).await;

    let receipt = signed_transaction("4000000011", "enterprise_monthly_subscription", datetime!(2026-02-01 0:00 UTC));
    h.service
        .receipts
        .validate_at(
            user.id,
            app_store_receipt("enterprise_monthly_subscription", &receipt),
            datetime!(2025-12-20 0:00 UTC),
        )
        .await
        .unwrap();

    let summary = h
        .service
        .lifecycle
        .run_expiry_sweep(old_end + Duration::hours(2))
        .await
        .unwrap();

    assert_eq!(summary.transitioned, 1);
    assert_eq!(summary.notices_sent, 0);
    let stored = h.store.get_subscription(pro.id).await.unwrap().unwrap();
    assert!(stored.is_fully_expired());
    assert_eq!(stored.metadata.expiry_notice_sent_at, None);
    assert_eq!(plan_of(&h.store, user.id).await, PlanTier::Enterprise);
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_restored_lapsed_receipt_expires_silently() {
    let mut h = harness().await;
    let _keys = mock_keys(&mut h.server).await;
    let user = insert_user(&h.store, PlanTier::Free).await;
    let now = datetime!(2026-01-10 0:00 UTC);

    let receipt = signed_transaction("4000000012", "pro_monthly_subscription", datetime!(2024-05-01 0:00 UTC));
    let restored = h
        .service
        .receipts
        .validate_at(user.id, app_store_receipt("pro_monthly_subscription", &receipt), now)
        .await
        .unwrap();
    assert_eq!(restored.status, SubscriptionStatus::Expired);

    h.service
        .lifecycle
        .run_expiry_sweep(now + Duration::hours(1))
        .await
        .unwrap();
    let summary = h
        .service
        .lifecycle
        .run_expiry_sweep(now + Duration::hours(2))
        .await
        .unwrap();

    assert_eq!(summary.examined, 0);
    let stored = h.store.get_subscription(restored.id).await.unwrap().unwrap();
    assert!(stored.is_fully_expired());
    assert_eq!(stored.metadata.expiry_notice_sent_at, None);
    assert_eq!(plan_of(&h.store, user.id).await, PlanTier::Free);
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_one_failing_row_does_not_stop_the_sweep() {
    let h = harness().await;
    let user = insert_user(&h.store, PlanTier::Pro).await;
    let period_end = datetime!(2026-01-01 0:00 UTC);
    // Orphan row whose user was deleted
    let orphan = subscription(uuid::Uuid::new_v4(), Platform::AppStore, "4000000003", SubscriptionStatus::Active, period_end);
    let healthy = subscription(user.id, Platform::AppStore, "4000000004", SubscriptionStatus::Active, period_end);
    h.store.insert_subscription(orphan).await;
    h.store.insert_subscription(healthy.clone()).await;

    let summary = h
        .service
        .lifecycle
        .run_expiry_sweep(period_end + Duration::days(1))
        .await
        .unwrap();

    assert_eq!(summary.examined, 2);
    assert_eq!(summary.transitioned, 1);
    assert_eq!(summary.errors, 1);
    let stored = h.store.get_subscription(healthy.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Expired);
}

#[tokio::test]
async fn test_warnings_sent_once_per_threshold() {
    let h = harness().await;
    let user = insert_user(&h.store, PlanTier::Pro).await;
    let period_end = datetime!(2026-01-01 12:00 UTC);
    let sub = subscription(user.id, Platform::AppStore, "4000000005", SubscriptionStatus::Active, period_end);
    h.store.insert_subscription(sub.clone()).await;
    let lifecycle = &h.service.lifecycle;

    for day in [
        datetime!(2025-12-25 9:00 UTC),
        datetime!(2025-12-25 10:00 UTC),
        datetime!(2025-12-26 9:00 UTC),
        datetime!(2025-12-29 9:00 UTC),
        datetime!(2025-12-29 9:00 UTC),
        datetime!(2025-12-31 9:00 UTC),
    ] {
        let summary = lifecycle.run_warning_sweep(day).await.unwrap();
        assert_eq!(summary.errors, 0);
    }

    let days: Vec<u32> = h
        .notifier
        .sent()
        .into_iter()
        .filter_map(|sent| match sent {
            Sent::Warning { days_left, .. } => Some(days_left),
            _ => None,
        })
        .collect();
    assert_eq!(days, vec![7, 3, 1]);

    let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(stored.metadata.sent_warnings.len(), 3);
    assert_eq!(stored.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn test_renewal_reopens_warnings() {
    let mut h = harness().await;
    let _keys = mock_keys(&mut h.server).await;
    let user = insert_user(&h.store, PlanTier::Free).await;
    let first_end = datetime!(2026-01-01 12:00 UTC);

    let receipt = signed_transaction("4000000006", "pro_monthly_subscription", first_end);
    let submission = plansync_billing::ReceiptSubmission {
        platform: Platform::AppStore,
        product_id: "pro_monthly_subscription",
        receipt: &receipt,
        client_transaction_id: None,
    };
    h.service
        .receipts
        .validate_at(user.id, submission, datetime!(2025-12-01 0:00 UTC))
        .await
        .unwrap();
    h.service
        .lifecycle
        .run_warning_sweep(datetime!(2025-12-31 9:00 UTC))
        .await
        .unwrap();

    // The renewal lands and a new period starts
    let second_end = datetime!(2026-02-01 12:00 UTC);
    let renewed = signed_transaction("4000000006", "pro_monthly_subscription", second_end);
    let submission = plansync_billing::ReceiptSubmission {
        receipt: &renewed,
        ..submission
    };
    h.service
        .receipts
        .validate_at(user.id, submission, datetime!(2026-01-01 13:00 UTC))
        .await
        .unwrap();
    h.service
        .lifecycle
        .run_warning_sweep(datetime!(2026-01-31 9:00 UTC))
        .await
        .unwrap();

    let warnings = h
        .notifier
        .sent()
        .into_iter()
        .filter(|sent| matches!(sent, Sent::Warning { days_left: 1, .. }))
        .count();
    assert_eq!(warnings, 2);
}
