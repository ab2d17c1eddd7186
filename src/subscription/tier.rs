//! Subscription tiers.

use crate::error::{Error, Result};
use crate::payment::types::decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Seconds in one validity day.
pub const SECS_PER_DAY: u64 = 86_400;

/// A purchasable storage allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tier {
    /// Tier id, e.g. `basic`.
    pub id: String,
    /// Price in atomic units.
    #[serde(with = "decimal", alias = "price_atomic")]
    pub price_atomic: u128,
    /// Quota granted per purchase, MB.
    #[serde(rename = "quotaMB", alias = "quota_mb")]
    pub quota_mb: u64,
    /// Validity added per purchase, days.
    #[serde(alias = "validity_days")]
    pub validity_days: u64,
}

impl Tier {
    /// Create a tier.
    pub fn new(id: impl Into<String>, price_atomic: u128, quota_mb: u64, validity_days: u64) -> Self {
        Self {
            id: id.into(),
            price_atomic,
            quota_mb,
            validity_days,
        }
    }

    /// Validity added per purchase, seconds.
    #[must_use]
    pub const fn validity_secs(&self) -> u64 {
        self.validity_days.saturating_mul(SECS_PER_DAY)
    }
}

/// The immutable set of tiers this gateway sells.
#[derive(Debug, Clone)]
pub struct TierCatalog {
    tiers: Vec<Tier>,
}

impl TierCatalog {
    /// Build a catalog.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the catalog is empty, an id repeats, or a
    /// tier grants no quota or no validity.
    pub fn new(tiers: Vec<Tier>) -> Result<Self> {
        if tiers.is_empty() {
            return Err(Error::Config("at least one tier is required".to_string()));
        }
        let mut seen = HashSet::new();
        for tier in &tiers {
            if tier.id.trim().is_empty() {
                return Err(Error::Config("tier id must not be empty".to_string()));
            }
            if !seen.insert(tier.id.as_str()) {
                return Err(Error::Config(format!("duplicate tier id: {}", tier.id)));
            }
            if tier.quota_mb == 0 || tier.validity_days == 0 {
                return Err(Error::Config(format!(
                    "tier {} must grant non-zero quota and validity",
                    tier.id
                )));
            }
        }
        Ok(Self { tiers })
    }

    /// Look up a tier by id.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for unknown ids.
    pub fn get(&self, id: &str) -> Result<&Tier> {
        self.tiers
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::NotFound(format!("tier {id}")))
    }

    /// All tiers in catalog order.
    pub fn iter(&self) -> impl Iterator<Item = &Tier> {
        self.tiers.iter()
    }

    /// Number of tiers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    /// Always false for a constructed catalog.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

/// The stock tiers: basic, standard and premium, priced in 6-decimal USDC.
#[must_use]
pub fn default_tiers() -> Vec<Tier> {
    vec![
        Tier::new("basic", 5_000_000, 1_000, 30),
        Tier::new("standard", 20_000_000, 5_000, 30),
        Tier::new("premium", 50_000_000, 20_000, 30),
    ]
}

impl Default for TierCatalog {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
        }
    }
}
