//! Test harness that runs a gateway node on a loopback port.
//!
//! Settlement and object listing are replaced with in-process fakes so the
//! full HTTP flow runs without a facilitator or a storage gateway.

use futures::future::BoxFuture;
use k256::ecdsa::SigningKey;
use parking_lot::Mutex;
use paygate_node::event::GatewayEventsChannel;
use paygate_node::feed::{FeedConfig, StaticValue};
use paygate_node::payment::eip712::{address_of, sign_authorization, TokenDomain};
use paygate_node::payment::{
    parse_address, unix_now, Address, Authorization, ExactPayload, Nonce, PaymentPayload,
    PaymentRequirements, PaymentVerifier, SettlementChannel, SettlementResult,
};
use paygate_node::storage::{ObjectLister, StoredObject, BYTES_PER_MB};
use paygate_node::{GatewayConfig, NodeBuilder, ProtocolHandler};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Recipient used by every test gateway.
pub const PAY_TO: &str = "0x209693Bc6afc0C5328bA36FaF03C514EF312287C";

/// Bearer secret for admin routes.
pub const ADMIN_SECRET: &str = "test-admin-secret";

/// Bearer secret the storage service presents.
pub const STORAGE_SECRET: &str = "test-storage-secret";

/// Price of the `eth-usd-price` feed in atomic units.
pub const FEED_PRICE: u128 = 1_000;

/// Error type for test harness operations.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Node error
    #[error("Node error: {0}")]
    Node(#[from] paygate_node::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Node task failed
    #[error("Node task failed: {0}")]
    Task(String),
}

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Settlement channel whose outcome tests can flip.
#[derive(Default)]
pub struct FakeSettlement {
    failing: AtomicBool,
    calls: AtomicU64,
}

impl FakeSettlement {
    /// Make subsequent settlements fail.
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    /// Number of times the channel was reached.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SettlementChannel for FakeSettlement {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn settle<'a>(
        &'a self,
        payload: &'a PaymentPayload,
        _requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, paygate_node::Result<SettlementResult>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            // Give concurrent duplicates a chance to pile up on the cache.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if self.failing.load(Ordering::SeqCst) {
                Ok(SettlementResult::failed(&payload.network, "facilitator_unreachable"))
            } else {
                Ok(SettlementResult {
                    success: true,
                    transaction_ref: Some(format!("0xtx{call:04}")),
                    network: payload.network.clone(),
                    error_reason: None,
                })
            }
        })
    }
}

/// Storage listing held in memory.
#[derive(Default)]
pub struct MemoryLister {
    objects: Mutex<HashMap<Address, Vec<StoredObject>>>,
}

impl MemoryLister {
    /// Replace the payer's listing with one object of `mb` megabytes.
    pub fn set_mb(&self, payer: Address, mb: u64) {
        let object = StoredObject {
            id: format!("{payer}-blob"),
            size_bytes: mb * BYTES_PER_MB,
        };
        self.objects.lock().insert(payer, vec![object]);
    }
}

impl ObjectLister for MemoryLister {
    fn list_objects(&self, payer: Address) -> BoxFuture<'_, paygate_node::Result<Vec<StoredObject>>> {
        let listing = self.objects.lock().get(&payer).cloned().unwrap_or_default();
        Box::pin(async move { Ok(listing) })
    }
}

/// Knobs for one test gateway.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Grant when settlement fails.
    pub fail_open: bool,
    /// Global quota ceiling, MB.
    pub global_capacity_mb: Option<u64>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            fail_open: true,
            global_capacity_mb: None,
        }
    }
}

/// A gateway node serving on a loopback port.
pub struct TestGateway {
    base_url: String,
    client: reqwest::Client,
    handler: Arc<ProtocolHandler>,
    settlement: Arc<FakeSettlement>,
    lister: Arc<MemoryLister>,
    domain: TokenDomain,
    events: Option<GatewayEventsChannel>,
    shutdown: Arc<watch::Sender<bool>>,
    task: JoinHandle<paygate_node::Result<()>>,
    _root: TempDir,
}

impl TestGateway {
    /// Start a gateway with default options.
    ///
    /// # Errors
    ///
    /// Returns an error if the node fails to build.
    pub async fn start() -> Result<Self> {
        Self::start_with(GatewayOptions::default()).await
    }

    /// Start a gateway with `options`.
    ///
    /// # Errors
    ///
    /// Returns an error if the node fails to build.
    pub async fn start_with(options: GatewayOptions) -> Result<Self> {
        let root = TempDir::new().map_err(paygate_node::Error::from)?;

        let mut config = GatewayConfig::default();
        config.root_dir = root.path().to_path_buf();
        config.listen_addr = ([127, 0, 0, 1], 0).into();
        config.admin_secret = Some(ADMIN_SECRET.to_string());
        config.storage_secret = Some(STORAGE_SECRET.to_string());
        config.payment.pay_to = Some(PAY_TO.to_string());
        config.settlement.fail_open = options.fail_open;
        config.capacity.global_capacity_mb = options.global_capacity_mb;
        config.reconciliation.interval_minutes = 0;

        let domain = PaymentVerifier::new(config.payment.verifier_config()?)
            .domain_for(parse_address(&config.payment.asset)?);

        let settlement = Arc::new(FakeSettlement::default());
        let lister = Arc::new(MemoryLister::default());

        let price_feed = FeedConfig::new(
            "eth-usd-price",
            "price",
            "price-v1",
            FEED_PRICE,
            Arc::new(StaticValue(serde_json::json!({ "pair": "ETH/USD", "price": 3150.25 }))),
        );
        let gas_feed = FeedConfig::new(
            "gas-price",
            "gas",
            "gas-v1",
            0,
            Arc::new(StaticValue(serde_json::json!({ "gwei": 12 }))),
        );

        let mut node = NodeBuilder::new(config)
            .with_settlement_channel(Arc::clone(&settlement) as Arc<dyn SettlementChannel>)
            .with_object_lister(Arc::clone(&lister) as Arc<dyn ObjectLister>)
            .with_feed(price_feed)
            .with_feed(gas_feed)
            .build()
            .await?;

        let base_url = format!("http://{}", node.local_addr());
        let handler = Arc::clone(node.handler());
        let events = node.events();
        let shutdown = node.shutdown_handle();
        let task = tokio::spawn(async move { node.run().await });
        info!("Test gateway listening on {base_url}");

        Ok(Self {
            base_url,
            client: reqwest::Client::new(),
            handler,
            settlement,
            lister,
            domain,
            events,
            shutdown,
            task,
            _root: root,
        })
    }

    /// The protocol handler behind the routes.
    pub fn handler(&self) -> &Arc<ProtocolHandler> {
        &self.handler
    }

    /// The fake settlement channel.
    pub fn settlement(&self) -> &FakeSettlement {
        &self.settlement
    }

    /// The fake object listing.
    pub fn lister(&self) -> &MemoryLister {
        &self.lister
    }

    /// Take the node's event receiver.
    pub fn events(&mut self) -> Option<GatewayEventsChannel> {
        self.events.take()
    }

    /// Sign a payment that satisfies `requirements`.
    ///
    /// # Panics
    ///
    /// Panics if signing fails.
    #[allow(clippy::expect_used)]
    pub fn pay(
        &self,
        key: &SigningKey,
        requirements: &PaymentRequirements,
        value: u128,
        nonce: u8,
    ) -> PaymentPayload {
        let now = unix_now();
        let authorization = Authorization {
            from: address_of(key.verifying_key()),
            to: requirements.pay_to,
            value,
            valid_after: now - 60,
            valid_before: now + requirements.max_timeout_seconds,
            nonce: Nonce([nonce; 32]),
        };
        let signature =
            sign_authorization(key, &authorization, &self.domain).expect("sign authorization");
        PaymentPayload {
            x402_version: 1,
            scheme: requirements.scheme.clone(),
            network: requirements.network.clone(),
            payload: ExactPayload {
                signature,
                authorization,
            },
        }
    }

    /// POST `body` to `path`, optionally with an `X-PAYMENT` header.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn post(
        &self,
        path: &str,
        body: &Value,
        payment: Option<&PaymentPayload>,
        bearer: Option<&str>,
    ) -> Result<(StatusCode, HeaderMap, Value)> {
        let mut request = self.client.post(self.url(path)).json(body);
        if let Some(payment) = payment {
            request = request.header("X-PAYMENT", encode(payment)?);
        }
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        Self::read(request.send().await?).await
    }

    /// GET `path`, optionally with an `X-PAYMENT` header.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn get(
        &self,
        path: &str,
        payment: Option<&PaymentPayload>,
    ) -> Result<(StatusCode, HeaderMap, Value)> {
        let mut request = self.client.get(self.url(path));
        if let Some(payment) = payment {
            request = request.header("X-PAYMENT", encode(payment)?);
        }
        Self::read(request.send().await?).await
    }

    /// Send a request with a raw `X-PAYMENT` header value.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn post_raw_payment(
        &self,
        path: &str,
        header: &str,
    ) -> Result<(StatusCode, HeaderMap, Value)> {
        let request = self
            .client
            .post(self.url(path))
            .header("X-PAYMENT", header);
        Self::read(request.send().await?).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn read(response: reqwest::Response) -> Result<(StatusCode, HeaderMap, Value)> {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.json::<Value>().await?;
        Ok((status, headers, body))
    }

    /// Stop the node and wait for it to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the node exited with an error.
    pub async fn teardown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| HarnessError::Task(e.to_string()))??;
        Ok(())
    }
}

fn encode(payment: &PaymentPayload) -> Result<String> {
    Ok(paygate_node::api::payment_header::encode_payment_header(
        payment,
    )?)
}

/// A fresh payer key.
pub fn payer_key() -> SigningKey {
    SigningKey::random(&mut rand::rngs::OsRng)
}

/// Address of `key`.
pub fn payer_address(key: &SigningKey) -> Address {
    address_of(key.verifying_key())
}

/// The first `accepts` entry of a 402 body.
///
/// # Panics
///
/// Panics if the body carries no requirements.
#[allow(clippy::expect_used)]
pub fn requirements_of(body: &Value) -> PaymentRequirements {
    serde_json::from_value(body["x402"]["accepts"][0].clone()).expect("x402 requirements")
}

/// Decode an `X-PAYMENT-RESPONSE` header.
///
/// # Panics
///
/// Panics if the header is missing or malformed.
#[allow(clippy::expect_used)]
pub fn settlement_of(headers: &HeaderMap) -> SettlementResult {
    use base64::Engine;
    let raw = headers
        .get("x-payment-response")
        .expect("X-PAYMENT-RESPONSE header")
        .to_str()
        .expect("ascii header");
    let json = base64::engine::general_purpose::STANDARD
        .decode(raw)
        .expect("base64 header");
    serde_json::from_slice(&json).expect("settlement json")
}
