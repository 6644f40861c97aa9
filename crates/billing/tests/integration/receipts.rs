use mockito::Matcher;
use plansync_billing::{BillingError, EntitlementState, ReceiptSubmission};
use plansync_shared::{Platform, PlanTier, SubscriptionStatus};
use time::macros::datetime;

use crate::support::*;

fn app_store<'a>(product_id: &'a str, receipt: &'a str) -> ReceiptSubmission<'a> {
    ReceiptSubmission {
        platform: Platform::AppStore,
        product_id,
        receipt,
        client_transaction_id: Some("client-tx-1"),
    }
}

fn play_store<'a>(product_id: &'a str, token: &'a str) -> ReceiptSubmission<'a> {
    ReceiptSubmission {
        platform: Platform::PlayStore,
        product_id,
        receipt: token,
        client_transaction_id: None,
    }
}

#[tokio::test]
async fn test_signed_receipt_grants_plan() {
    let mut h = harness().await;
    let _keys = mock_keys(&mut h.server).await;
    let user = insert_user(&h.store, PlanTier::Free).await;
    let now = datetime!(2025-06-01 0:00 UTC);
    let receipt = signed_transaction("2000000001", "pro_yearly_subscription", datetime!(2026-01-01 0:00 UTC));

    let sub = h
        .service
        .receipts
        .validate_at(user.id, app_store("pro_yearly_subscription", &receipt), now)
        .await
        .unwrap();

    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.plan, PlanTier::Pro);
    assert_eq!(sub.external_id, "2000000001");
    assert_eq!(sub.current_period_end, datetime!(2026-01-01 0:00 UTC));
    assert_eq!(sub.metadata.last_validated_at, Some(now));
    assert_eq!(sub.metadata.client_transaction_id.as_deref(), Some("client-tx-1"));

    let status = h.service.subscriptions.get_status_at(user.id, now).await.unwrap();
    assert_eq!(status.plan, PlanTier::Pro);
    assert_eq!(status.state, EntitlementState::Active);
    assert_eq!(plan_of(&h.store, user.id).await, PlanTier::Pro);
}

#[tokio::test]
async fn test_revalidation_is_idempotent() {
    let mut h = harness().await;
    let _keys = mock_keys(&mut h.server).await;
    let user = insert_user(&h.store, PlanTier::Free).await;
    let now = datetime!(2025-06-01 0:00 UTC);
    let receipt = signed_transaction("2000000002", "pro_monthly_subscription", datetime!(2025-07-01 0:00 UTC));

    let first = h
        .service
        .receipts
        .validate_at(user.id, app_store("pro_monthly_subscription", &receipt), now)
        .await
        .unwrap();
    let second = h
        .service
        .receipts
        .validate_at(user.id, app_store("pro_monthly_subscription", &receipt), now)
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(h.store.subscription_count().await, 1);
}

#[tokio::test]
async fn test_older_receipt_never_moves_period_end_back() {
    let mut h = harness().await;
    let _keys = mock_keys(&mut h.server).await;
    let user = insert_user(&h.store, PlanTier::Free).await;
    let now = datetime!(2025-06-01 0:00 UTC);

    let newer = signed_transaction("2000000003", "pro_monthly_subscription", datetime!(2025-08-01 0:00 UTC));
    let older = signed_transaction("2000000003", "pro_monthly_subscription", datetime!(2025-07-01 0:00 UTC));
    h.service
        .receipts
        .validate_at(user.id, app_store("pro_monthly_subscription", &newer), now)
        .await
        .unwrap();
    let sub = h
        .service
        .receipts
        .validate_at(user.id, app_store("pro_monthly_subscription", &older), now)
        .await
        .unwrap();

    assert_eq!(sub.current_period_end, datetime!(2025-08-01 0:00 UTC));
}

#[tokio::test]
async fn test_product_substitution_is_rejected() {
    let mut h = harness().await;
    let _keys = mock_keys(&mut h.server).await;
    let user = insert_user(&h.store, PlanTier::Free).await;
    // A cheap monthly receipt presented as the yearly enterprise product
    let receipt = signed_transaction("2000000004", "pro_monthly_subscription", datetime!(2026-01-01 0:00 UTC));

    let result = h
        .service
        .receipts
        .validate_at(
            user.id,
            app_store("enterprise_yearly_subscription", &receipt),
            datetime!(2025-06-01 0:00 UTC),
        )
        .await;

    assert!(matches!(result, Err(BillingError::ReceiptInvalid(_))));
    assert_eq!(h.store.subscription_count().await, 0);
    assert_eq!(plan_of(&h.store, user.id).await, PlanTier::Free);
}

#[tokio::test]
async fn test_unknown_product_makes_no_store_call() {
    let mut h = harness().await;
    let keys = mock_keys(&mut h.server).await.expect(0);
    let user = insert_user(&h.store, PlanTier::Free).await;
    let receipt = signed_transaction("2000000005", "pro_monthly_subscription", datetime!(2026-01-01 0:00 UTC));

    let result = h
        .service
        .receipts
        .validate_at(user.id, app_store("lifetime_unlock", &receipt), datetime!(2025-06-01 0:00 UTC))
        .await;

    assert!(matches!(result, Err(BillingError::InvalidProduct(_))));
    keys.assert_async().await;
}

#[tokio::test]
async fn test_forged_signature_is_rejected() {
    let mut h = harness().await;
    let _keys = mock_keys(&mut h.server).await;
    let user = insert_user(&h.store, PlanTier::Free).await;
    let receipt = untrusted_transaction("2000000006", "pro_monthly_subscription", datetime!(2026-01-01 0:00 UTC));

    let result = h
        .service
        .receipts
        .validate_at(user.id, app_store("pro_monthly_subscription", &receipt), datetime!(2025-06-01 0:00 UTC))
        .await;

    assert!(matches!(result, Err(BillingError::ReceiptInvalid(_))));
}

#[tokio::test]
async fn test_receipt_linked_to_another_user() {
    let mut h = harness().await;
    let _keys = mock_keys(&mut h.server).await;
    let owner = insert_user(&h.store, PlanTier::Free).await;
    let other = insert_user(&h.store, PlanTier::Free).await;
    let now = datetime!(2025-06-01 0:00 UTC);
    let receipt = signed_transaction("2000000007", "pro_monthly_subscription", datetime!(2026-01-01 0:00 UTC));

    h.service
        .receipts
        .validate_at(owner.id, app_store("pro_monthly_subscription", &receipt), now)
        .await
        .unwrap();
    let result = h
        .service
        .receipts
        .validate_at(other.id, app_store("pro_monthly_subscription", &receipt), now)
        .await;

    assert!(matches!(result, Err(BillingError::ReceiptInvalid(_))));
    assert_eq!(plan_of(&h.store, other.id).await, PlanTier::Free);
}

#[tokio::test]
async fn test_legacy_receipt_platform_down_after_three_attempts() {
    let mut h = harness().await;
    let verify = h
        .server
        .mock("POST", "/verifyReceipt")
        .with_status(503)
        .expect(3)
        .create_async()
        .await;
    let user = insert_user(&h.store, PlanTier::Free).await;

    let result = h
        .service
        .receipts
        .validate_at(
            user.id,
            app_store("pro_monthly_subscription", "MIIT0QYJKoZIhvcNAQcCoIITwjCCE74CAQEx"),
            datetime!(2025-06-01 0:00 UTC),
        )
        .await;

    assert!(matches!(result, Err(BillingError::ServiceUnavailable(_))));
    verify.assert_async().await;
    assert_eq!(h.store.subscription_count().await, 0);
}

#[tokio::test]
async fn test_legacy_sandbox_receipt_retried_once() {
    let mut h = harness().await;
    let production = h
        .server
        .mock("POST", "/verifyReceipt")
        .match_body(Matcher::PartialJson(serde_json::json!({ "password": "shared-secret" })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"status":21007}"#)
        .expect(1)
        .create_async()
        .await;
    let sandbox = h
        .server
        .mock("POST", "/sandbox/verifyReceipt")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            serde_json::json!({
                "status": 0,
                "environment": "Sandbox",
                "receipt": { "bundle_id": BUNDLE_ID },
                "latest_receipt_info": [
                    {
                        "original_transaction_id": "3000000001",
                        "transaction_id": "3000000010",
                        "product_id": "pro_monthly_subscription",
                        "expires_date_ms": millis(datetime!(2025-06-15 0:00 UTC)).to_string()
                    },
                    {
                        "original_transaction_id": "3000000001",
                        "transaction_id": "3000000011",
                        "product_id": "pro_monthly_subscription",
                        "expires_date_ms": millis(datetime!(2025-07-15 0:00 UTC)).to_string()
                    }
                ]
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;
    let user = insert_user(&h.store, PlanTier::Free).await;

    let sub = h
        .service
        .receipts
        .validate_at(
            user.id,
            app_store("pro_monthly_subscription", "MIIT0QYJKoZIhvcNAQcCoIITwjCCE74CAQEx"),
            datetime!(2025-06-20 0:00 UTC),
        )
        .await
        .unwrap();

    production.assert_async().await;
    sandbox.assert_async().await;
    assert_eq!(sub.external_id, "3000000001");
    assert_eq!(sub.current_period_end, datetime!(2025-07-15 0:00 UTC));
    assert_eq!(sub.metadata.environment.as_deref(), Some("Sandbox"));
    assert_eq!(sub.metadata.order_id.as_deref(), Some("3000000011"));
}

#[tokio::test]
async fn test_legacy_receipt_rejected_status() {
    let mut h = harness().await;
    let _mock = h
        .server
        .mock("POST", "/verifyReceipt")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"status":21003}"#)
        .create_async()
        .await;
    let user = insert_user(&h.store, PlanTier::Free).await;

    let result = h
        .service
        .receipts
        .validate_at(
            user.id,
            app_store("pro_monthly_subscription", "MIIT0QYJKoZIhvcNAQcCoIITwjCCE74CAQEx"),
            datetime!(2025-06-01 0:00 UTC),
        )
        .await;
    assert!(matches!(result, Err(BillingError::ReceiptInvalid(_))));
}

#[tokio::test]
async fn test_play_purchase_token_validation_reuses_access_token() {
    let mut h = harness().await;
    let token = mock_play_token(&mut h.server).await.expect(1);
    let status = mock_play_subscription(
        &mut h.server,
        "play-token-1",
        "enterprise_monthly_subscription",
        datetime!(2025-07-01 0:00 UTC),
    )
    .await
    .expect(2);
    let user = insert_user(&h.store, PlanTier::Free).await;
    let now = datetime!(2025-06-01 0:00 UTC);

    for _ in 0..2 {
        let sub = h
            .service
            .receipts
            .validate_at(user.id, play_store("enterprise_monthly_subscription", "play-token-1"), now)
            .await
            .unwrap();
        assert_eq!(sub.platform, Platform::PlayStore);
        assert_eq!(sub.plan, PlanTier::Enterprise);
        assert_eq!(sub.metadata.order_id.as_deref(), Some("GPA.3312-4455-6677-88990"));
    }

    token.assert_async().await;
    status.assert_async().await;
    assert_eq!(plan_of(&h.store, user.id).await, PlanTier::Enterprise);
}

#[tokio::test]
async fn test_play_product_mismatch() {
    let mut h = harness().await;
    let _token = mock_play_token(&mut h.server).await;
    let _status = mock_play_subscription(
        &mut h.server,
        "play-token-2",
        "pro_monthly_subscription",
        datetime!(2025-07-01 0:00 UTC),
    )
    .await;
    let user = insert_user(&h.store, PlanTier::Free).await;

    let result = h
        .service
        .receipts
        .validate_at(
            user.id,
            play_store("enterprise_yearly_subscription", "play-token-2"),
            datetime!(2025-06-01 0:00 UTC),
        )
        .await;

    assert!(matches!(result, Err(BillingError::ReceiptInvalid(_))));
    assert_eq!(h.store.subscription_count().await, 0);
}

#[tokio::test]
async fn test_play_credentials_refused() {
    let mut h = harness().await;
    let _mock = h
        .server
        .mock("POST", "/token")
        .with_status(400)
        .with_body(r#"{"error":"invalid_grant"}"#)
        .create_async()
        .await;
    let user = insert_user(&h.store, PlanTier::Free).await;

    let result = h
        .service
        .receipts
        .validate_at(
            user.id,
            play_store("pro_monthly_subscription", "play-token-3"),
            datetime!(2025-06-01 0:00 UTC),
        )
        .await;

    assert!(matches!(result, Err(BillingError::AuthFailure(_))));
}
