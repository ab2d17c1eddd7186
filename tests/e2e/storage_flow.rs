//! Subscription purchase, quota admission and usage reconciliation.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::harness::{
    payer_address, payer_key, requirements_of, settlement_of, ADMIN_SECRET, STORAGE_SECRET,
};
use super::TestGateway;
use paygate_node::storage::BYTES_PER_MB;
use paygate_node::GatewayEvent;
use reqwest::StatusCode;
use serde_json::json;
use std::time::Duration;

fn approx(value: &serde_json::Value, expected: f64) -> bool {
    value
        .as_f64()
        .is_some_and(|v| (v - expected).abs() < 1e-6)
}

/// The basic-tier walkthrough: challenge, pay, upload, reconcile, delete.
#[tokio::test]
async fn test_basic_tier_storage_lifecycle() {
    let mut gateway = TestGateway::start().await.expect("Failed to start gateway");
    let mut events = gateway.events().expect("event receiver");
    let key = payer_key();
    let payer = payer_address(&key);

    // No payment: 402 with the tier's terms
    let (status, _, body) = gateway
        .post("/subscriptions/basic", &json!({}), None, None)
        .await
        .unwrap();
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["success"], false);
    assert_eq!(body["paymentRequired"], true);
    let requirements = requirements_of(&body);
    assert_eq!(requirements.max_amount_required, 5_000_000);
    assert_eq!(requirements.resource, "/subscriptions/basic");

    // Pay: 200 with the record and the settlement header
    let payment = gateway.pay(&key, &requirements, 5_000_000, 1);
    let (status, headers, body) = gateway
        .post("/subscriptions/basic", &json!({}), Some(&payment), None)
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["subscription"]["tier"], "basic");
    assert_eq!(body["subscription"]["quotaMB"], 1000);
    let settlement = settlement_of(&headers);
    assert!(settlement.success);
    assert!(settlement.transaction_ref.is_some());

    let granted = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let GatewayEvent::SubscriptionGranted { payer: p, tier, .. } =
                events.recv().await.expect("event")
            {
                return (p, tier);
            }
        }
    })
    .await
    .expect("SubscriptionGranted event");
    assert_eq!(granted, (payer, "basic".to_string()));

    let (status, _, body) = gateway
        .get(&format!("/subscriptions/{payer}"), None)
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], true);
    assert_eq!(body["quotaMB"], 1000);

    // Upload 250 MB
    let (status, _, body) = gateway
        .post(
            &format!("/storage/{payer}/uploads"),
            &json!({ "sizeBytes": 250 * BYTES_PER_MB }),
            None,
            Some(STORAGE_SECRET),
        )
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], true);
    assert!(approx(&body["remainingMB"], 750.0));

    // Storage actually holds 237 MB: reconciliation corrects the ledger
    gateway.lister().set_mb(payer, 237);
    let (status, _, body) = gateway
        .post(
            &format!("/admin/usage-sync/{payer}"),
            &json!({}),
            None,
            Some(ADMIN_SECRET),
        )
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    let report = &body["report"];
    assert!(approx(&report["previousMB"], 250.0));
    assert!(approx(&report["currentMB"], 237.0));
    assert!(approx(&report["discrepancy"], 13.0));
    assert_eq!(report["corrected"], true);

    // 800 MB no longer fits in the remaining 763 MB
    let (status, _, body) = gateway
        .post(
            &format!("/storage/{payer}/uploads"),
            &json!({ "sizeBytes": 800 * BYTES_PER_MB }),
            None,
            Some(STORAGE_SECRET),
        )
        .await
        .unwrap();
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["allowed"], false);
    assert!(approx(&body["remainingMB"], 763.0));

    // Deleting 37 MB frees quota
    let (status, _, body) = gateway
        .post(
            &format!("/storage/{payer}/deletions"),
            &json!({ "sizeBytes": 37 * BYTES_PER_MB }),
            None,
            Some(STORAGE_SECRET),
        )
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    assert!(approx(&body["usedMB"], 200.0));

    gateway.teardown().await.expect("Failed to teardown");
}

#[tokio::test]
async fn test_renewal_adds_quota() {
    let gateway = TestGateway::start().await.expect("Failed to start gateway");
    let key = payer_key();

    let (_, _, body) = gateway
        .post("/subscriptions/basic", &json!({}), None, None)
        .await
        .unwrap();
    let requirements = requirements_of(&body);

    for (nonce, expected_quota) in [(1u8, 1000), (2u8, 2000)] {
        let payment = gateway.pay(&key, &requirements, 5_000_000, nonce);
        let (status, _, body) = gateway
            .post("/subscriptions/basic", &json!({}), Some(&payment), None)
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["subscription"]["quotaMB"], expected_quota);
    }
    assert_eq!(gateway.settlement().calls(), 2);

    gateway.teardown().await.expect("Failed to teardown");
}

#[tokio::test]
async fn test_payment_in_body_is_accepted() {
    let gateway = TestGateway::start().await.expect("Failed to start gateway");
    let key = payer_key();

    let (_, _, body) = gateway
        .post("/subscriptions/standard", &json!({}), None, None)
        .await
        .unwrap();
    let requirements = requirements_of(&body);
    assert_eq!(requirements.max_amount_required, 20_000_000);

    let payment = gateway.pay(&key, &requirements, 20_000_000, 7);
    let (status, _, body) = gateway
        .post("/subscriptions/standard", &json!({ "payment": payment }), None, None)
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subscription"]["quotaMB"], 5000);

    gateway.teardown().await.expect("Failed to teardown");
}

#[tokio::test]
async fn test_upload_without_subscription_is_refused() {
    let gateway = TestGateway::start().await.expect("Failed to start gateway");
    let payer = payer_address(&payer_key());

    let (status, _, body) = gateway
        .post(
            &format!("/storage/{payer}/uploads"),
            &json!({ "sizeBytes": 1024 }),
            None,
            Some(STORAGE_SECRET),
        )
        .await
        .unwrap();
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["allowed"], false);

    let (status, _, body) = gateway
        .get(&format!("/subscriptions/{payer}"), None)
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "active": false }));

    gateway.teardown().await.expect("Failed to teardown");
}

#[tokio::test]
async fn test_admin_routes_require_secret() {
    let gateway = TestGateway::start().await.expect("Failed to start gateway");
    let payer = payer_address(&payer_key());
    let path = format!("/admin/usage-override/{payer}");

    for bearer in [None, Some("wrong-secret")] {
        let (status, _, body) = gateway
            .post(&path, &json!({ "usedMB": 1.0 }), None, bearer)
            .await
            .unwrap();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, json!({ "success": false, "error": "Unauthorized" }));
    }

    // Authorized, but the payer has no record
    let (status, _, _) = gateway
        .post(&path, &json!({ "usedMB": 1.0 }), None, Some(ADMIN_SECRET))
        .await
        .unwrap();
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, body) = gateway
        .post("/admin/usage-sync", &json!({}), None, Some(ADMIN_SECRET))
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checked"], 0);

    gateway.teardown().await.expect("Failed to teardown");
}

#[tokio::test]
async fn test_storage_routes_require_secret() {
    let gateway = TestGateway::start().await.expect("Failed to start gateway");
    let key = payer_key();
    let payer = payer_address(&key);

    let (_, _, body) = gateway
        .post("/subscriptions/basic", &json!({}), None, None)
        .await
        .unwrap();
    let requirements = requirements_of(&body);
    let payment = gateway.pay(&key, &requirements, 5_000_000, 1);
    let (status, _, _) = gateway
        .post("/subscriptions/basic", &json!({}), Some(&payment), None)
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);

    for route in ["uploads", "deletions"] {
        for bearer in [None, Some("wrong-secret"), Some(ADMIN_SECRET)] {
            let (status, _, body) = gateway
                .post(
                    &format!("/storage/{payer}/{route}"),
                    &json!({ "sizeBytes": 500 * BYTES_PER_MB }),
                    None,
                    bearer,
                )
                .await
                .unwrap();
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{route} with {bearer:?}");
            assert_eq!(body, json!({ "success": false, "error": "Unauthorized" }));
        }
    }

    // Nothing was recorded by the refused calls
    let (_, _, body) = gateway
        .get(&format!("/subscriptions/{payer}"), None)
        .await
        .unwrap();
    assert!(approx(&body["usedMB"], 0.0));

    gateway.teardown().await.expect("Failed to teardown");
}

#[tokio::test]
async fn test_malformed_requests_are_bad_requests() {
    let gateway = TestGateway::start().await.expect("Failed to start gateway");

    let (status, _, body) = gateway
        .get("/subscriptions/not-an-address", None)
        .await
        .unwrap();
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, _, body) = gateway
        .post_raw_payment("/subscriptions/basic", "%%%not-base64%%%")
        .await
        .unwrap();
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"], "X-PAYMENT is not valid base64 JSON");

    let payer = payer_address(&payer_key());
    let (status, _, body) = gateway
        .post(
            &format!("/storage/{payer}/uploads"),
            &json!({ "sizeBytes": "lots" }),
            None,
            Some(STORAGE_SECRET),
        )
        .await
        .unwrap();
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body,
        json!({
            "success": false,
            "error": "Invalid request",
            "details": "missing or invalid sizeBytes",
        })
    );

    let (status, _, body) = gateway
        .post("/subscriptions/platinum", &json!({}), None, None)
        .await
        .unwrap();
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Not found");

    gateway.teardown().await.expect("Failed to teardown");
}
