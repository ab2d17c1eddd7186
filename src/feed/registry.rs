//! Registered feeds, their value providers and the paid-access log.

use crate::error::{Error, Result};
use crate::feed::signer::compute_feed_id;
use crate::payment::Address;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Default number of access records kept in memory.
pub const DEFAULT_ACCESS_LOG_CAPACITY: usize = 10_000;

/// Source of a feed's current value.
pub trait ValueProvider: Send + Sync {
    /// Produce the value to sign into the next packet.
    fn current_value(&self) -> BoxFuture<'_, Result<serde_json::Value>>;
}

/// A provider that always returns the same value.
#[derive(Debug, Clone)]
pub struct StaticValue(pub serde_json::Value);

impl ValueProvider for StaticValue {
    fn current_value(&self) -> BoxFuture<'_, Result<serde_json::Value>> {
        let value = self.0.clone();
        Box::pin(async move { Ok(value) })
    }
}

/// A provider backed by a synchronous closure.
pub struct FnProvider<F>(pub F);

impl<F> ValueProvider for FnProvider<F>
where
    F: Fn() -> Result<serde_json::Value> + Send + Sync,
{
    fn current_value(&self) -> BoxFuture<'_, Result<serde_json::Value>> {
        let value = (self.0)();
        Box::pin(async move { value })
    }
}

/// A named, independently priced data feed.
#[derive(Clone)]
pub struct FeedConfig {
    /// Feed name.
    pub name: String,
    /// `compute_feed_id(name)`.
    pub feed_id: String,
    /// Free-form data type label (e.g. `price`).
    pub data_type: String,
    /// Schema identifier placed in every packet.
    pub schema: String,
    /// Price per packet in atomic units. Zero means free.
    pub price_atomic: u128,
    /// Expected update frequency, advertised only.
    pub update_freq_secs: u64,
    /// Inactive feeds are reported as not found.
    pub active: bool,
    /// Where packet values come from.
    pub value_provider: Arc<dyn ValueProvider>,
}

impl FeedConfig {
    /// Build an active feed; the id is derived from `name`.
    pub fn new(
        name: impl Into<String>,
        data_type: impl Into<String>,
        schema: impl Into<String>,
        price_atomic: u128,
        value_provider: Arc<dyn ValueProvider>,
    ) -> Self {
        let name = name.into();
        Self {
            feed_id: compute_feed_id(&name),
            name,
            data_type: data_type.into(),
            schema: schema.into(),
            price_atomic,
            update_freq_secs: 60,
            active: true,
            value_provider,
        }
    }

    /// Set the advertised update frequency.
    #[must_use]
    pub fn with_update_freq(mut self, secs: u64) -> Self {
        self.update_freq_secs = secs;
        self
    }

    /// Whether packets for this feed are given away.
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.price_atomic == 0
    }

    /// Serializable view for listings.
    #[must_use]
    pub fn descriptor(&self) -> FeedDescriptor {
        FeedDescriptor {
            name: self.name.clone(),
            feed_id: self.feed_id.clone(),
            data_type: self.data_type.clone(),
            schema: self.schema.clone(),
            price_atomic: self.price_atomic.to_string(),
            update_freq_secs: self.update_freq_secs,
            active: self.active,
        }
    }
}

impl fmt::Debug for FeedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedConfig")
            .field("name", &self.name)
            .field("feed_id", &self.feed_id)
            .field("schema", &self.schema)
            .field("price_atomic", &self.price_atomic)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

/// Listing entry for a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedDescriptor {
    /// Feed name.
    pub name: String,
    /// Derived feed id.
    pub feed_id: String,
    /// Data type label.
    pub data_type: String,
    /// Schema identifier.
    pub schema: String,
    /// Price in atomic units, decimal string.
    pub price_atomic: String,
    /// Advertised update frequency.
    pub update_freq_secs: u64,
    /// Whether the feed is served.
    pub active: bool,
}

/// Owned store of feeds keyed by derived id.
#[derive(Default)]
pub struct FeedRegistry {
    feeds: RwLock<HashMap<String, FeedConfig>>,
}

impl FeedRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a feed, returning its id.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the name is empty or already registered.
    pub fn register(&self, feed: FeedConfig) -> Result<String> {
        if feed.name.trim().is_empty() {
            return Err(Error::Validation("feed name must not be empty".to_string()));
        }
        let feed_id = compute_feed_id(&feed.name);
        let mut feeds = self.feeds.write();
        if feeds.contains_key(&feed_id) {
            return Err(Error::Validation(format!(
                "feed {} is already registered",
                feed.name
            )));
        }
        info!("Registered feed {} ({feed_id})", feed.name);
        feeds.insert(feed_id.clone(), FeedConfig { feed_id: feed_id.clone(), ..feed });
        Ok(feed_id)
    }

    /// Look a feed up by name.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<FeedConfig> {
        self.get_by_id(&compute_feed_id(name))
    }

    /// Look a feed up by derived id.
    #[must_use]
    pub fn get_by_id(&self, feed_id: &str) -> Option<FeedConfig> {
        self.feeds.read().get(&feed_id.to_ascii_lowercase()).cloned()
    }

    /// All feeds, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<FeedDescriptor> {
        let mut list: Vec<_> = self.feeds.read().values().map(FeedConfig::descriptor).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Enable or disable a feed.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for unknown feeds.
    pub fn set_active(&self, name: &str, active: bool) -> Result<()> {
        let mut feeds = self.feeds.write();
        let feed = feeds
            .get_mut(&compute_feed_id(name))
            .ok_or_else(|| Error::NotFound(format!("feed {name}")))?;
        feed.active = active;
        debug!("Feed {name} active={active}");
        Ok(())
    }

    /// Number of registered feeds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.feeds.read().len()
    }

    /// Whether no feeds are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.feeds.read().is_empty()
    }
}

/// One granted paid feed access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedAccessRecord {
    /// Paying address.
    pub payer: Address,
    /// Feed id.
    pub feed_id: String,
    /// Feed name.
    pub feed_name: String,
    /// Amount authorized, atomic units.
    pub amount: String,
    /// Settlement transaction reference, if settled.
    pub transaction_ref: Option<String>,
    /// Whether settlement succeeded.
    pub settled: bool,
    /// Unix seconds of the grant.
    pub timestamp: u64,
}

/// Bounded in-memory log of paid feed accesses, oldest evicted first.
pub struct FeedAccessLog {
    records: Mutex<VecDeque<FeedAccessRecord>>,
    capacity: usize,
}

impl FeedAccessLog {
    /// Create a log holding at most `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Append a record.
    pub fn append(&self, record: FeedAccessRecord) {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// The most recent `limit` records, newest last.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<FeedAccessRecord> {
        let records = self.records.lock();
        let skip = records.len().saturating_sub(limit);
        records.iter().skip(skip).cloned().collect()
    }

    /// Records for one payer.
    #[must_use]
    pub fn for_payer(&self, payer: &Address) -> Vec<FeedAccessRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| &r.payer == payer)
            .cloned()
            .collect()
    }

    /// Number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl Default for FeedAccessLog {
    fn default() -> Self {
        Self::new(DEFAULT_ACCESS_LOG_CAPACITY)
    }
}
