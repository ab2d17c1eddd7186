//! Settlement outcomes, replays and capacity refusals over HTTP.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::harness::{payer_address, payer_key, requirements_of, settlement_of};
use super::{GatewayOptions, TestGateway};
use paygate_node::GatewayEvent;
use reqwest::StatusCode;
use serde_json::json;

#[tokio::test]
async fn test_fail_open_grants_despite_settlement_failure() {
    let mut gateway = TestGateway::start().await.expect("Failed to start gateway");
    let mut events = gateway.events().expect("event receiver");
    gateway.settlement().fail();
    let key = payer_key();

    let (_, _, body) = gateway
        .post("/subscriptions/basic", &json!({}), None, None)
        .await
        .unwrap();
    let payment = gateway.pay(&key, &requirements_of(&body), 5_000_000, 1);
    let (status, headers, body) = gateway
        .post("/subscriptions/basic", &json!({}), Some(&payment), None)
        .await
        .unwrap();

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["settlementFailed"], true);
    let settlement = settlement_of(&headers);
    assert!(!settlement.success);
    assert_eq!(
        settlement.error_reason.as_deref(),
        Some("facilitator_unreachable")
    );

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if let GatewayEvent::SettlementFailed { payer, .. } = event {
            assert_eq!(payer, payer_address(&key));
            saw_failure = true;
        }
    }
    assert!(saw_failure);

    gateway.teardown().await.expect("Failed to teardown");
}

#[tokio::test]
async fn test_strict_mode_rejects_failed_settlement() {
    let gateway = TestGateway::start_with(GatewayOptions {
        fail_open: false,
        ..GatewayOptions::default()
    })
    .await
    .expect("Failed to start gateway");
    gateway.settlement().fail();
    let key = payer_key();

    let (_, _, body) = gateway
        .post("/subscriptions/basic", &json!({}), None, None)
        .await
        .unwrap();
    let payment = gateway.pay(&key, &requirements_of(&body), 5_000_000, 1);
    let (status, _, body) = gateway
        .post("/subscriptions/basic", &json!({}), Some(&payment), None)
        .await
        .unwrap();

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["invalidReason"], "settlement_failed");
    assert_eq!(body["settlementError"], "facilitator_unreachable");
    assert!(gateway
        .handler()
        .ledger()
        .get_record(&payer_address(&key))
        .is_none());

    gateway.teardown().await.expect("Failed to teardown");
}

#[tokio::test]
async fn test_replayed_payment_is_rejected_without_resettling() {
    let gateway = TestGateway::start().await.expect("Failed to start gateway");
    let key = payer_key();

    let (_, _, body) = gateway
        .post("/subscriptions/basic", &json!({}), None, None)
        .await
        .unwrap();
    let payment = gateway.pay(&key, &requirements_of(&body), 5_000_000, 9);

    let (status, _, _) = gateway
        .post("/subscriptions/basic", &json!({}), Some(&payment), None)
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = gateway
        .post("/subscriptions/basic", &json!({}), Some(&payment), None)
        .await
        .unwrap();
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["invalidReason"], "nonce_already_used");
    assert_eq!(gateway.settlement().calls(), 1);

    let record = gateway
        .handler()
        .ledger()
        .get_record(&payer_address(&key))
        .unwrap();
    assert_eq!(record.quota_mb, 1000);

    gateway.teardown().await.expect("Failed to teardown");
}

#[tokio::test]
async fn test_concurrent_duplicates_settle_once() {
    let gateway = TestGateway::start().await.expect("Failed to start gateway");
    let key = payer_key();

    let (_, _, body) = gateway
        .post("/subscriptions/basic", &json!({}), None, None)
        .await
        .unwrap();
    let payment = gateway.pay(&key, &requirements_of(&body), 5_000_000, 3);

    let empty = json!({});
    let first = gateway.post("/subscriptions/basic", &empty, Some(&payment), None);
    let second = gateway.post("/subscriptions/basic", &empty, Some(&payment), None);
    let (first, second) = tokio::join!(first, second);

    let mut statuses = [first.unwrap().0.as_u16(), second.unwrap().0.as_u16()];
    statuses.sort_unstable();
    assert_eq!(statuses, [200, 402]);
    assert_eq!(gateway.settlement().calls(), 1);

    gateway.teardown().await.expect("Failed to teardown");
}

#[tokio::test]
async fn test_underpayment_is_rejected() {
    let gateway = TestGateway::start().await.expect("Failed to start gateway");
    let key = payer_key();

    let (_, _, body) = gateway
        .post("/subscriptions/basic", &json!({}), None, None)
        .await
        .unwrap();
    let payment = gateway.pay(&key, &requirements_of(&body), 4_999_999, 1);
    let (status, _, body) = gateway
        .post("/subscriptions/basic", &json!({}), Some(&payment), None)
        .await
        .unwrap();

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["invalidReason"], "insufficient_amount");
    assert_eq!(body["x402"]["accepts"][0]["maxAmountRequired"], "5000000");
    assert_eq!(gateway.settlement().calls(), 0);

    gateway.teardown().await.expect("Failed to teardown");
}

#[tokio::test]
async fn test_capacity_ceiling_refuses_new_subscriptions() {
    let gateway = TestGateway::start_with(GatewayOptions {
        global_capacity_mb: Some(1_500),
        ..GatewayOptions::default()
    })
    .await
    .expect("Failed to start gateway");
    let key = payer_key();

    let (_, _, body) = gateway
        .post("/subscriptions/basic", &json!({}), None, None)
        .await
        .unwrap();
    let payment = gateway.pay(&key, &requirements_of(&body), 5_000_000, 1);
    let (status, _, _) = gateway
        .post("/subscriptions/basic", &json!({}), Some(&payment), None)
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);

    // 1000 of 1500 MB allocated: the 1000 MB tier no longer fits
    let (status, _, body) = gateway
        .post("/subscriptions/basic", &json!({}), None, None)
        .await
        .unwrap();
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Capacity exceeded");

    let (status, _, body) = gateway.get("/tiers", None).await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allocatedMB"], 1000);
    assert_eq!(body["capacityMB"], 1500);
    let tiers = body["tiers"].as_array().unwrap();
    assert!(tiers.iter().all(|t| t["available"] == false));

    gateway.teardown().await.expect("Failed to teardown");
}
