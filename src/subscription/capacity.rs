//! Global ceiling on allocated quota.

use crate::error::{Error, Result};
use crate::subscription::tier::TierCatalog;
use serde::Serialize;
use std::sync::Arc;

/// Default utilisation at which admissions start carrying a warning.
pub const DEFAULT_WARNING_THRESHOLD: f64 = 0.8;

/// Admission decision for a new allocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityDecision {
    /// Whether the allocation fits.
    pub allowed: bool,
    /// Non-blocking notice that utilisation is high.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// Why the allocation was denied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CapacityDecision {
    const fn allow() -> Self {
        Self {
            allowed: true,
            warning: None,
            reason: None,
        }
    }
}

/// Admits subscriptions only while they fit under the global capacity.
///
/// Checked at admission time only; capacity consumed outside the gateway is
/// not tracked.
#[derive(Debug, Clone)]
pub struct CapacityGate {
    catalog: Arc<TierCatalog>,
    warning_threshold: f64,
}

impl CapacityGate {
    /// Create a gate with the default warning threshold.
    #[must_use]
    pub fn new(catalog: Arc<TierCatalog>) -> Self {
        Self {
            catalog,
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
        }
    }

    /// Override the warning threshold, a fraction in `(0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for thresholds outside `(0, 1]`.
    pub fn with_warning_threshold(mut self, threshold: f64) -> Result<Self> {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(Error::Config(format!(
                "warning threshold must be in (0, 1], got {threshold}"
            )));
        }
        self.warning_threshold = threshold;
        Ok(self)
    }

    /// The configured warning threshold.
    #[must_use]
    pub const fn warning_threshold(&self) -> f64 {
        self.warning_threshold
    }

    /// Decide whether a `tier_id` purchase fits. `None` capacity is unlimited.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for unknown tiers.
    pub fn can_accept_new_subscription(
        &self,
        tier_id: &str,
        global_used_mb: u64,
        global_capacity_mb: Option<u64>,
    ) -> Result<CapacityDecision> {
        let tier = self.catalog.get(tier_id)?;
        let Some(capacity) = global_capacity_mb else {
            return Ok(CapacityDecision::allow());
        };

        let free = capacity.saturating_sub(global_used_mb);
        if free < tier.quota_mb {
            return Ok(CapacityDecision {
                allowed: false,
                warning: None,
                reason: Some(format!(
                    "tier {} needs {}MB but only {free}MB of {capacity}MB is free",
                    tier.id, tier.quota_mb
                )),
            });
        }

        let mut decision = CapacityDecision::allow();
        let utilisation = if capacity == 0 {
            1.0
        } else {
            global_used_mb as f64 / capacity as f64
        };
        if utilisation >= self.warning_threshold {
            decision.warning = Some(format!(
                "storage capacity {:.0}% allocated ({global_used_mb}MB of {capacity}MB)",
                utilisation * 100.0
            ));
        }
        Ok(decision)
    }
}
