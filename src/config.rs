//! Configuration for paygate-node.

use crate::error::{Error, Result};
use crate::payment::types::decimal;
use crate::payment::{parse_address, PaymentVerifierConfig};
use crate::protocol::PaymentTerms;
use crate::subscription::{default_tiers, Tier, TierCatalog, LEDGER_FILE_NAME};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Root directory for gateway data.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// HTTP listen address (port 0 for auto-select).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Shared secret for admin endpoints. Admin endpoints are disabled
    /// without one.
    #[serde(default)]
    pub admin_secret: Option<String>,

    /// Shared secret the storage service presents when admitting uploads and
    /// releasing deletions. Those routes are disabled without one.
    #[serde(default)]
    pub storage_secret: Option<String>,

    /// Payment terms.
    #[serde(default)]
    pub payment: PaymentConfig,

    /// Settlement configuration.
    #[serde(default)]
    pub settlement: SettlementSection,

    /// Global capacity.
    #[serde(default)]
    pub capacity: CapacityConfig,

    /// Usage reconciliation.
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,

    /// Feed signing.
    #[serde(default)]
    pub feeds: FeedsConfig,

    /// Subscription tiers.
    #[serde(default = "default_tiers")]
    pub tiers: Vec<Tier>,

    /// Feeds served with a fixed value.
    #[serde(default, rename = "feed")]
    pub feed: Vec<FeedSpec>,
}

/// Where and how the gateway gets paid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Network name placed in challenges.
    #[serde(default = "default_network")]
    pub network: String,

    /// Chain id for the EIP-712 domain. Derived from `network` when unset.
    #[serde(default)]
    pub chain_id: Option<u64>,

    /// Stablecoin contract.
    #[serde(default = "default_asset")]
    pub asset: String,

    /// Stablecoin EIP-712 name.
    #[serde(default = "default_asset_name")]
    pub asset_name: String,

    /// Stablecoin EIP-712 version.
    #[serde(default = "default_asset_version")]
    pub asset_version: String,

    /// Recipient of payments. Required.
    #[serde(default)]
    pub pay_to: Option<String>,

    /// Time a payer has to complete payment.
    #[serde(default = "default_max_timeout")]
    pub max_timeout_seconds: u64,
}

/// Settlement configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementSection {
    /// x402 facilitator base URL. Without one, settlement always fails and
    /// the fail-open policy decides.
    #[serde(default)]
    pub facilitator_url: Option<String>,

    /// Upper bound for one settlement attempt.
    #[serde(default = "default_settlement_timeout")]
    pub timeout_secs: u64,

    /// Grant access even when settlement fails.
    #[serde(default = "default_true")]
    pub fail_open: bool,

    /// Nonces preallocated in the idempotence and replay stores. Live nonces
    /// are kept past this figure until their authorization expires.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

/// Global capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityConfig {
    /// Ceiling on allocated quota, MB. Unlimited when unset.
    #[serde(default)]
    pub global_capacity_mb: Option<u64>,

    /// Utilisation fraction at which admissions carry a warning.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
}

/// Usage reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Storage gateway base URL. Reconciliation is unavailable when unset.
    #[serde(default)]
    pub gateway_url: Option<String>,

    /// Upper bound for one object listing.
    #[serde(default = "default_listing_timeout")]
    pub timeout_secs: u64,

    /// Minutes between sweeps (0 disables).
    #[serde(default = "default_sync_interval")]
    pub interval_minutes: u64,

    /// Differences at or below this many MB are ignored.
    #[serde(default = "default_tolerance")]
    pub tolerance_mb: f64,

    /// Payers reconciled in parallel.
    #[serde(default = "default_sync_concurrency")]
    pub concurrency: usize,
}

/// Feed signing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedsConfig {
    /// Packet validity.
    #[serde(default = "default_validity")]
    pub default_validity_secs: u64,

    /// ML-DSA-65 secret key file. An ephemeral key is generated when unset.
    #[serde(default)]
    pub signing_key_path: Option<PathBuf>,

    /// ML-DSA-65 public key file.
    #[serde(default)]
    pub public_key_path: Option<PathBuf>,
}

/// A feed defined in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSpec {
    /// Feed name.
    pub name: String,

    /// Data type label.
    #[serde(default = "default_data_type")]
    pub data_type: String,

    /// Schema identifier.
    pub schema: String,

    /// Price per packet in atomic units (0 is free).
    #[serde(with = "decimal")]
    pub price_atomic: u128,

    /// Advertised update frequency.
    #[serde(default = "default_update_freq")]
    pub update_freq_secs: u64,

    /// Whether the feed is served.
    #[serde(default = "default_true")]
    pub active: bool,

    /// Value signed into every packet.
    pub value: serde_json::Value,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            listen_addr: default_listen_addr(),
            log_level: default_log_level(),
            admin_secret: None,
            storage_secret: None,
            payment: PaymentConfig::default(),
            settlement: SettlementSection::default(),
            capacity: CapacityConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            feeds: FeedsConfig::default(),
            tiers: default_tiers(),
            feed: Vec::new(),
        }
    }
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            chain_id: None,
            asset: default_asset(),
            asset_name: default_asset_name(),
            asset_version: default_asset_version(),
            pay_to: None,
            max_timeout_seconds: default_max_timeout(),
        }
    }
}

impl Default for SettlementSection {
    fn default() -> Self {
        Self {
            facilitator_url: None,
            timeout_secs: default_settlement_timeout(),
            fail_open: true,
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            global_capacity_mb: None,
            warning_threshold: default_warning_threshold(),
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            gateway_url: None,
            timeout_secs: default_listing_timeout(),
            interval_minutes: default_sync_interval(),
            tolerance_mb: default_tolerance(),
            concurrency: default_sync_concurrency(),
        }
    }
}

impl Default for FeedsConfig {
    fn default() -> Self {
        Self {
            default_validity_secs: default_validity(),
            signing_key_path: None,
            public_key_path: None,
        }
    }
}

fn default_root_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "paygate")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".paygate"))
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4020))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_network() -> String {
    "base-sepolia".to_string()
}

fn default_asset() -> String {
    // USDC on Base Sepolia
    "0x036CbD53842c5426634e7929541eC2318f3dCF7e".to_string()
}

fn default_asset_name() -> String {
    "USDC".to_string()
}

fn default_asset_version() -> String {
    "2".to_string()
}

fn default_data_type() -> String {
    "json".to_string()
}

const fn default_max_timeout() -> u64 {
    300
}

const fn default_settlement_timeout() -> u64 {
    30
}

const fn default_true() -> bool {
    true
}

const fn default_cache_capacity() -> usize {
    100_000
}

const fn default_warning_threshold() -> f64 {
    0.8
}

const fn default_listing_timeout() -> u64 {
    30
}

const fn default_sync_interval() -> u64 {
    60
}

const fn default_tolerance() -> f64 {
    0.01
}

const fn default_sync_concurrency() -> usize {
    8
}

const fn default_validity() -> u64 {
    60
}

const fn default_update_freq() -> u64 {
    60
}

/// Chain id of a well-known x402 network name.
#[must_use]
pub fn chain_id_for_network(network: &str) -> Option<u64> {
    match network {
        "base" => Some(8453),
        "base-sepolia" => Some(84532),
        "avalanche" => Some(43114),
        "avalanche-fuji" => Some(43113),
        "polygon" => Some(137),
        "polygon-amoy" => Some(80002),
        _ => None,
    }
}

impl PaymentConfig {
    /// Chain id from config or the network name.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for unknown networks without a `chain_id`.
    pub fn resolve_chain_id(&self) -> Result<u64> {
        self.chain_id
            .or_else(|| chain_id_for_network(&self.network))
            .ok_or_else(|| {
                Error::Config(format!(
                    "unknown network {}: set payment.chain_id",
                    self.network
                ))
            })
    }

    /// Parsed payment terms.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `pay_to` is missing or an address is malformed.
    pub fn terms(&self) -> Result<PaymentTerms> {
        let pay_to = self
            .pay_to
            .as_deref()
            .ok_or_else(|| Error::Config("payment.pay_to is required".to_string()))?;
        Ok(PaymentTerms {
            network: self.network.clone(),
            pay_to: parse_address(pay_to)
                .map_err(|e| Error::Config(format!("payment.pay_to: {e}")))?,
            asset: parse_address(&self.asset)
                .map_err(|e| Error::Config(format!("payment.asset: {e}")))?,
            asset_name: self.asset_name.clone(),
            asset_version: self.asset_version.clone(),
            max_timeout_seconds: self.max_timeout_seconds,
        })
    }

    /// Verifier settings for this network and asset.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the chain id cannot be resolved.
    pub fn verifier_config(&self) -> Result<PaymentVerifierConfig> {
        Ok(PaymentVerifierConfig {
            chain_id: self.resolve_chain_id()?,
            asset_name: self.asset_name.clone(),
            asset_version: self.asset_version.clone(),
        })
    }
}

impl SettlementSection {
    /// Settlement timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ReconciliationConfig {
    /// Listing timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Sweep interval, `None` when disabled.
    #[must_use]
    pub const fn interval(&self) -> Option<Duration> {
        if self.interval_minutes == 0 {
            None
        } else {
            Some(Duration::from_secs(self.interval_minutes * 60))
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Where the subscription snapshot lives.
    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.root_dir.join(LEDGER_FILE_NAME)
    }

    /// The tier catalog.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid tier list.
    pub fn tier_catalog(&self) -> Result<TierCatalog> {
        TierCatalog::new(self.tiers.clone())
    }

    /// Check the configuration for mistakes that would only surface at
    /// request time.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.payment.network.trim().is_empty() {
            return Err(Error::Config("payment.network must not be empty".to_string()));
        }
        self.payment.terms()?;
        self.payment.resolve_chain_id()?;
        self.tier_catalog()?;

        let threshold = self.capacity.warning_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(Error::Config(format!(
                "capacity.warning_threshold must be in (0, 1], got {threshold}"
            )));
        }
        if self.settlement.timeout_secs == 0 {
            return Err(Error::Config("settlement.timeout_secs must be > 0".to_string()));
        }
        if let Some(ref url) = self.settlement.facilitator_url {
            check_url("settlement.facilitator_url", url)?;
        }
        if let Some(ref url) = self.reconciliation.gateway_url {
            check_url("reconciliation.gateway_url", url)?;
        }
        if !(self.reconciliation.tolerance_mb.is_finite() && self.reconciliation.tolerance_mb >= 0.0)
        {
            return Err(Error::Config(
                "reconciliation.tolerance_mb must be >= 0".to_string(),
            ));
        }
        if self.feeds.default_validity_secs == 0 {
            return Err(Error::Config(
                "feeds.default_validity_secs must be > 0".to_string(),
            ));
        }
        if self.feeds.signing_key_path.is_some() != self.feeds.public_key_path.is_some() {
            return Err(Error::Config(
                "feeds.signing_key_path and feeds.public_key_path must be set together"
                    .to_string(),
            ));
        }
        if matches!(self.admin_secret.as_deref(), Some(s) if s.is_empty()) {
            return Err(Error::Config("admin_secret must not be empty".to_string()));
        }
        if matches!(self.storage_secret.as_deref(), Some(s) if s.is_empty()) {
            return Err(Error::Config("storage_secret must not be empty".to_string()));
        }

        let mut names = HashSet::new();
        for feed in &self.feed {
            if feed.name.trim().is_empty() {
                return Err(Error::Config("feed name must not be empty".to_string()));
            }
            if !names.insert(feed.name.as_str()) {
                return Err(Error::Config(format!("duplicate feed: {}", feed.name)));
            }
        }
        Ok(())
    }
}

fn check_url(field: &str, url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(Error::Config(format!("{field} must be an http(s) URL")))
    }
}
