//! Signed feed packets over HTTP.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::harness::{payer_address, payer_key, requirements_of, settlement_of, FEED_PRICE};
use super::TestGateway;
use paygate_node::feed::{compute_feed_id, verify_packet};
use paygate_node::SignedPacket;
use reqwest::StatusCode;

const DEFAULT_VALIDITY_SECS: u64 = 60;

#[tokio::test]
async fn test_feed_listing_advertises_signer() {
    let gateway = TestGateway::start().await.expect("Failed to start gateway");

    let (status, _, body) = gateway.get("/feeds", None).await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["signerPublicKey"],
        gateway.handler().signer().public_key_hex()
    );

    let feeds = body["feeds"].as_array().unwrap();
    let names: Vec<_> = feeds.iter().map(|f| f["name"].as_str().unwrap()).collect();
    assert_eq!(names, ["eth-usd-price", "gas-price"]);
    assert_eq!(feeds[0]["feedId"], compute_feed_id("eth-usd-price"));

    gateway.teardown().await.expect("Failed to teardown");
}

#[tokio::test]
async fn test_free_feed_is_released_without_payment() {
    let gateway = TestGateway::start().await.expect("Failed to start gateway");

    let (status, headers, body) = gateway.get("/feeds/gas-price", None).await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert!(headers.get("x-payment-response").is_none());

    let packet: SignedPacket = serde_json::from_value(body["packet"].clone()).unwrap();
    assert_eq!(packet.value["gwei"], 12);
    verify_packet(&packet, gateway.handler().signer().public_key()).unwrap();

    gateway.teardown().await.expect("Failed to teardown");
}

#[tokio::test]
async fn test_paid_feed_challenge_then_purchase() {
    let gateway = TestGateway::start().await.expect("Failed to start gateway");
    let key = payer_key();

    // Challenge carries the pre-signed packet
    let (status, _, body) = gateway.get("/feeds/eth-usd-price", None).await.unwrap();
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    let preview: SignedPacket = serde_json::from_value(body["packet"].clone()).unwrap();
    assert_eq!(preview.valid_until, preview.timestamp + DEFAULT_VALIDITY_SECS);
    verify_packet(&preview, gateway.handler().signer().public_key()).unwrap();

    let requirements = requirements_of(&body);
    assert_eq!(requirements.max_amount_required, FEED_PRICE);
    assert_eq!(requirements.resource, "/feeds/eth-usd-price");

    // Pay for it
    let payment = gateway.pay(&key, &requirements, FEED_PRICE, 1);
    let (status, headers, body) = gateway
        .get("/feeds/eth-usd-price", Some(&payment))
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    assert!(settlement_of(&headers).success);

    let packet: SignedPacket = serde_json::from_value(body["packet"].clone()).unwrap();
    assert_eq!(packet.feed_name, "eth-usd-price");
    assert_eq!(packet.schema, "price-v1");
    verify_packet(&packet, gateway.handler().signer().public_key()).unwrap();

    let log = gateway
        .handler()
        .access_log()
        .for_payer(&payer_address(&key));
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].amount, FEED_PRICE.to_string());
    assert!(log[0].settled);

    gateway.teardown().await.expect("Failed to teardown");
}

#[tokio::test]
async fn test_tampered_packet_fails_verification() {
    let gateway = TestGateway::start().await.expect("Failed to start gateway");

    let (_, _, body) = gateway.get("/feeds/gas-price", None).await.unwrap();
    let mut packet: SignedPacket = serde_json::from_value(body["packet"].clone()).unwrap();
    packet.valid_until += 3_600;
    assert!(verify_packet(&packet, gateway.handler().signer().public_key()).is_err());

    gateway.teardown().await.expect("Failed to teardown");
}

#[tokio::test]
async fn test_unknown_and_inactive_feeds_are_not_found() {
    let gateway = TestGateway::start().await.expect("Failed to start gateway");

    let (status, _, _) = gateway.get("/feeds/btc-usd-price", None).await.unwrap();
    assert_eq!(status, StatusCode::NOT_FOUND);

    gateway
        .handler()
        .feeds()
        .set_active("gas-price", false)
        .unwrap();
    let (status, _, body) = gateway.get("/feeds/gas-price", None).await.unwrap();
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);

    gateway.teardown().await.expect("Failed to teardown");
}
