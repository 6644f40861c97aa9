use plansync_billing::{QuotaDecision, ReceiptSubmission};
use plansync_shared::{Platform, PlanTier, ResourceKind};
use time::macros::datetime;

use crate::support::*;

#[tokio::test]
async fn test_concurrent_reservations_at_the_last_slot() {
    let h = harness().await;
    let user = insert_user(&h.store, PlanTier::Free).await;
    let quota = &h.service.quota;

    let (a, b) = tokio::join!(
        quota.check_and_reserve(user.id, ResourceKind::Project),
        quota.check_and_reserve(user.id, ResourceKind::Project),
    );
    let mut decisions = vec![a.unwrap(), b.unwrap()];
    decisions.sort_by_key(|d| !d.is_reserved());

    assert_eq!(decisions[0], QuotaDecision::Reserved { remaining: Some(0) });
    assert_eq!(decisions[1], QuotaDecision::Exceeded { limit: 1, current: 1 });
}

#[tokio::test]
async fn test_release_frees_a_slot() {
    let h = harness().await;
    let user = insert_user(&h.store, PlanTier::Free).await;
    h.store.set_usage(user.id, ResourceKind::Document, 10).await;
    let quota = &h.service.quota;

    assert!(!quota
        .check_and_reserve(user.id, ResourceKind::Document)
        .await
        .unwrap()
        .is_reserved());

    quota.release(user.id, ResourceKind::Document).await.unwrap();
    assert!(quota
        .check_and_reserve(user.id, ResourceKind::Document)
        .await
        .unwrap()
        .is_reserved());

    let usage = quota.usage(user.id).await.unwrap();
    let documents = usage.iter().find(|u| u.kind == ResourceKind::Document).unwrap();
    assert_eq!(documents.used, 10);
    assert_eq!(documents.remaining, Some(0));
}

#[tokio::test]
async fn test_upgrade_raises_limits() {
    let mut h = harness().await;
    let _keys = mock_keys(&mut h.server).await;
    let user = insert_user(&h.store, PlanTier::Free).await;
    h.store.set_usage(user.id, ResourceKind::Project, 1).await;

    let before = h
        .service
        .quota
        .check_and_reserve(user.id, ResourceKind::Project)
        .await
        .unwrap();
    assert_eq!(before, QuotaDecision::Exceeded { limit: 1, current: 1 });

    let receipt = signed_transaction("6000000001", "enterprise_monthly_subscription", datetime!(2026-01-01 0:00 UTC));
    h.service
        .receipts
        .validate_at(
            user.id,
            ReceiptSubmission {
                platform: Platform::AppStore,
                product_id: "enterprise_monthly_subscription",
                receipt: &receipt,
                client_transaction_id: None,
            },
            datetime!(2025-12-05 0:00 UTC),
        )
        .await
        .unwrap();

    let after = h
        .service
        .quota
        .check_and_reserve(user.id, ResourceKind::Project)
        .await
        .unwrap();
    assert_eq!(after, QuotaDecision::Reserved { remaining: None });

    let usage = h.service.quota.usage(user.id).await.unwrap();
    let projects = usage.iter().find(|u| u.kind == ResourceKind::Project).unwrap();
    assert_eq!(projects.used, 2);
    assert_eq!(projects.limit, None);
}
