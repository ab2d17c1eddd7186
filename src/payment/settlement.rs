//! Exactly-once settlement of verified payments.
//!
//! The executor hands a verified payload to a [`SettlementChannel`] (an x402
//! facilitator, or nothing at all) and memoises the outcome per nonce.
//! Whatever the first attempt produced, success, failure or timeout, is the
//! answer for that nonce from then on.

use crate::error::{Error, Result};
use crate::payment::cache::{CacheStats, SettlementCache};
use crate::payment::types::{
    PaymentPayload, PaymentRequirements, SettlementResult, X402_VERSION,
};
use crate::payment::verifier::unix_now;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Failure reason recorded when the channel does not answer in time.
pub const REASON_TIMEOUT: &str = "settlement_timeout";

/// Failure reason recorded when the channel errors out.
pub const REASON_ERROR: &str = "settlement_error";

/// Failure reason recorded when no settlement channel is configured.
pub const REASON_UNAVAILABLE: &str = "settlement_unavailable";

/// Something that can finalize a verified payment.
pub trait SettlementChannel: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Finalize `payload` against `requirements`.
    fn settle<'a>(
        &'a self,
        payload: &'a PaymentPayload,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<SettlementResult>>;
}

/// Configuration for the settlement executor.
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Upper bound for one settlement attempt.
    pub timeout: Duration,
    /// Nonces preallocated in the idempotence cache. Live nonces are kept
    /// past this figure until they expire.
    pub cache_capacity: usize,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            cache_capacity: crate::payment::cache::DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Settles payments at most once per authorization nonce.
pub struct SettlementExecutor {
    channel: Arc<dyn SettlementChannel>,
    cache: SettlementCache,
    config: SettlementConfig,
    executions: AtomicU64,
}

impl SettlementExecutor {
    /// Create an executor over `channel`.
    #[must_use]
    pub fn new(channel: Arc<dyn SettlementChannel>, config: SettlementConfig) -> Self {
        info!(
            "Settlement executor initialized (channel={}, timeout={:?}, cache_capacity={})",
            channel.name(),
            config.timeout,
            config.cache_capacity
        );
        Self {
            channel,
            cache: SettlementCache::with_capacity(config.cache_capacity),
            config,
            executions: AtomicU64::new(0),
        }
    }

    /// Settle `payload`, or return the recorded outcome if its nonce was
    /// already attempted. Never fails: channel errors and timeouts become a
    /// `success=false` result.
    pub async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> SettlementResult {
        self.settle_at(payload, requirements, unix_now()).await
    }

    /// [`Self::settle`] as of unix time `now`, which decides which recorded
    /// nonces have expired.
    pub async fn settle_at(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
        now: u64,
    ) -> SettlementResult {
        let nonce = payload.nonce();
        let valid_before = payload.payload.authorization.valid_before;
        let (slot, hit) = self.cache.slot(nonce, valid_before, now);
        if hit {
            debug!("Settlement for nonce {nonce} already attempted, reusing outcome");
        }

        let result = slot
            .get_or_init(|| async {
                self.executions.fetch_add(1, Ordering::SeqCst);
                debug!("Settling nonce {nonce} via {}", self.channel.name());

                match tokio::time::timeout(
                    self.config.timeout,
                    self.channel.settle(payload, requirements),
                )
                .await
                {
                    Ok(Ok(result)) => {
                        if result.success {
                            info!(
                                "Settled nonce {nonce} on {} (tx={})",
                                result.network,
                                result.transaction_ref.as_deref().unwrap_or("-")
                            );
                        } else {
                            warn!(
                                "Settlement of nonce {nonce} failed: {}",
                                result.error_reason.as_deref().unwrap_or("unknown")
                            );
                        }
                        result
                    }
                    Ok(Err(e)) => {
                        warn!("Settlement channel error for nonce {nonce}: {e}");
                        SettlementResult::failed(&payload.network, REASON_ERROR)
                    }
                    Err(_) => {
                        warn!(
                            "Settlement of nonce {nonce} timed out after {:?}",
                            self.config.timeout
                        );
                        SettlementResult::failed(&payload.network, REASON_TIMEOUT)
                    }
                }
            })
            .await;

        result.clone()
    }

    /// Number of times the channel was actually invoked.
    #[must_use]
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    /// Idempotence cache statistics.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

/// Settles through an x402 facilitator's `/settle` endpoint.
pub struct FacilitatorChannel {
    client: reqwest::Client,
    settle_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FacilitatorSettleRequest<'a> {
    x402_version: u8,
    payment_payload: &'a PaymentPayload,
    payment_requirements: &'a PaymentRequirements,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FacilitatorSettleResponse {
    success: bool,
    #[serde(default)]
    transaction: Option<String>,
    #[serde(default)]
    network: Option<String>,
    #[serde(default)]
    error_reason: Option<String>,
}

impl FacilitatorChannel {
    /// Create a channel for the facilitator at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            settle_url: format!("{}/settle", base_url.trim_end_matches('/')),
        })
    }
}

impl SettlementChannel for FacilitatorChannel {
    fn name(&self) -> &'static str {
        "facilitator"
    }

    fn settle<'a>(
        &'a self,
        payload: &'a PaymentPayload,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<SettlementResult>> {
        Box::pin(async move {
            let request = FacilitatorSettleRequest {
                x402_version: X402_VERSION,
                payment_payload: payload,
                payment_requirements: requirements,
            };

            let response = self
                .client
                .post(&self.settle_url)
                .json(&request)
                .send()
                .await
                .map_err(|e| Error::Network(format!("facilitator request failed: {e}")))?;

            if !response.status().is_success() {
                return Err(Error::Network(format!(
                    "facilitator returned HTTP {}",
                    response.status()
                )));
            }

            let body: FacilitatorSettleResponse = response
                .json()
                .await
                .map_err(|e| Error::Serialization(format!("bad facilitator response: {e}")))?;

            Ok(SettlementResult {
                success: body.success,
                transaction_ref: body.transaction.filter(|tx| !tx.is_empty()),
                network: body.network.unwrap_or_else(|| payload.network.clone()),
                error_reason: if body.success { None } else { body.error_reason },
            })
        })
    }
}

/// Used when no facilitator is configured: every attempt fails, leaving the
/// payment for out-of-band settlement.
pub struct UnconfiguredChannel;

impl SettlementChannel for UnconfiguredChannel {
    fn name(&self) -> &'static str {
        "unconfigured"
    }

    fn settle<'a>(
        &'a self,
        payload: &'a PaymentPayload,
        _requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<SettlementResult>> {
        Box::pin(async move { Ok(SettlementResult::failed(&payload.network, REASON_UNAVAILABLE)) })
    }
}
