//! Authoritative listings of a payer's stored objects.

use crate::error::{Error, Result};
use crate::payment::Address;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Bytes per MB used for quota arithmetic.
pub const BYTES_PER_MB: u64 = 1_048_576;

/// Convert a byte count to MB.
#[must_use]
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB as f64
}

/// One object held by the storage network for a payer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    /// Object identifier.
    pub id: String,
    /// Object size in bytes.
    pub size_bytes: u64,
}

/// Total size of `objects`, MB.
#[must_use]
pub fn total_mb(objects: &[StoredObject]) -> f64 {
    let bytes = objects
        .iter()
        .map(|o| o.size_bytes)
        .fold(0u64, u64::saturating_add);
    bytes_to_mb(bytes)
}

/// Source of ground truth for usage reconciliation.
pub trait ObjectLister: Send + Sync {
    /// Enumerate every object stored for `payer`.
    fn list_objects(&self, payer: Address) -> BoxFuture<'_, Result<Vec<StoredObject>>>;
}

/// Lists objects through the storage gateway's HTTP API.
///
/// `GET {base_url}/objects/{payer}` returns `[{id, sizeBytes}]`.
#[derive(Debug, Clone)]
pub struct GatewayLister {
    client: reqwest::Client,
    base_url: String,
}

impl GatewayLister {
    /// Create a lister for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Network` if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("failed to build gateway client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl ObjectLister for GatewayLister {
    fn list_objects(&self, payer: Address) -> BoxFuture<'_, Result<Vec<StoredObject>>> {
        Box::pin(async move {
            let url = format!("{}/objects/{payer}", self.base_url);
            debug!("Listing objects: GET {url}");

            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| Error::Network(format!("object listing failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                return Err(Error::Storage(format!(
                    "object listing for {payer} returned {status}"
                )));
            }

            response
                .json::<Vec<StoredObject>>()
                .await
                .map_err(|e| Error::Storage(format!("malformed object listing: {e}")))
        })
    }
}

/// Used when no gateway is configured: every payer holds nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyLister;

impl ObjectLister for EmptyLister {
    fn list_objects(&self, _payer: Address) -> BoxFuture<'_, Result<Vec<StoredObject>>> {
        Box::pin(async { Err(Error::Storage("no storage gateway configured".to_string())) })
    }
}
