//! Incremental usage tracking and reconciliation against the storage network.
//!
//! The counter kept in the ledger is an optimisation. Whenever the storage
//! listing disagrees with it by more than the tolerance, the listing wins.

use crate::error::{Error, Result};
use crate::event::{GatewayEvent, GatewayEventsSender};
use crate::payment::{unix_now, Address};
use crate::storage::{total_mb, ObjectLister, StoredObject};
use crate::subscription::ledger::SubscriptionLedger;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Usage meter settings.
#[derive(Debug, Clone)]
pub struct MeterConfig {
    /// Differences at or below this many MB are rounding noise.
    pub tolerance_mb: f64,
    /// Upper bound on one object listing.
    pub listing_timeout: Duration,
    /// Payers reconciled in parallel by a sweep.
    pub sync_concurrency: usize,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            tolerance_mb: 0.01,
            listing_timeout: Duration::from_secs(30),
            sync_concurrency: 8,
        }
    }
}

/// Answer to "may this payer store `requested` more MB".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeDecision {
    /// Whether the request fits in an active subscription.
    pub allowed: bool,
    /// Quota left once the request is stored, or the current headroom when
    /// the request is denied, MB.
    #[serde(rename = "remainingMB")]
    pub remaining_mb: f64,
}

impl ConsumeDecision {
    const fn denied() -> Self {
        Self {
            allowed: false,
            remaining_mb: 0.0,
        }
    }

    fn against(available_mb: f64, requested_mb: f64) -> Self {
        if available_mb >= requested_mb {
            Self {
                allowed: true,
                remaining_mb: available_mb - requested_mb,
            }
        } else {
            Self {
                allowed: false,
                remaining_mb: available_mb,
            }
        }
    }
}

/// Outcome of checking one payer's usage against ground truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Payer.
    pub payer: Address,
    /// Tracked usage before the check, MB.
    #[serde(rename = "previousMB")]
    pub previous_mb: f64,
    /// Usage after the check, MB.
    #[serde(rename = "currentMB")]
    pub current_mb: f64,
    /// `previousMB - currentMB`.
    pub discrepancy: f64,
    /// Whether the ledger was overwritten.
    pub corrected: bool,
}

/// Result of reconciling every known payer.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    /// One report per payer that was checked.
    pub reports: Vec<ReconcileReport>,
    /// Payers whose listing failed.
    pub failed: usize,
}

impl SyncSummary {
    /// Number of payers whose usage was overwritten.
    #[must_use]
    pub fn corrected(&self) -> usize {
        self.reports.iter().filter(|r| r.corrected).count()
    }
}

/// Tracks per-payer usage in the subscription ledger.
pub struct UsageMeter {
    ledger: Arc<SubscriptionLedger>,
    lister: Arc<dyn ObjectLister>,
    config: MeterConfig,
    events: Option<GatewayEventsSender>,
}

impl UsageMeter {
    /// Create a meter over `ledger`, using `lister` as ground truth.
    #[must_use]
    pub fn new(
        ledger: Arc<SubscriptionLedger>,
        lister: Arc<dyn ObjectLister>,
        config: MeterConfig,
    ) -> Self {
        Self {
            ledger,
            lister,
            config,
            events: None,
        }
    }

    /// Emit `UsageReconciled` events on `sender`.
    #[must_use]
    pub fn with_events(mut self, sender: GatewayEventsSender) -> Self {
        self.events = Some(sender);
        self
    }

    /// The underlying ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<SubscriptionLedger> {
        &self.ledger
    }

    /// Add `delta_mb` (negative on deletion) to the payer's usage, returning
    /// the new total. Usage never drops below zero.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the payer has no subscription record, or
    /// `Error::Validation` for a non-finite delta.
    pub async fn record_usage(&self, payer: Address, delta_mb: f64) -> Result<f64> {
        if !delta_mb.is_finite() {
            return Err(Error::Validation("usage delta must be finite".to_string()));
        }
        self.ledger
            .update(payer, |slot| {
                let record = slot
                    .as_mut()
                    .ok_or_else(|| Error::NotFound(format!("subscription for {payer}")))?;
                record.used_mb = (record.used_mb + delta_mb).max(0.0);
                debug!("Usage for {payer} {delta_mb:+.3}MB -> {:.3}MB", record.used_mb);
                Ok(record.used_mb)
            })
            .await
    }

    /// Whether `payer` may store `requested_mb` more, as of now.
    #[must_use]
    pub fn can_consume(&self, payer: &Address, requested_mb: f64) -> ConsumeDecision {
        self.can_consume_at(payer, requested_mb, unix_now())
    }

    /// Whether `payer` may store `requested_mb` more, as of `now`.
    #[must_use]
    pub fn can_consume_at(&self, payer: &Address, requested_mb: f64, now: u64) -> ConsumeDecision {
        match self.ledger.get_record(payer) {
            Some(record) if record.is_active_at(now) => {
                ConsumeDecision::against(record.remaining_mb(), requested_mb)
            }
            _ => ConsumeDecision::denied(),
        }
    }

    /// Check and record `requested_mb` under one payer lock.
    ///
    /// Usage is recorded only if the returned decision allows it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for negative or non-finite sizes.
    pub async fn consume_at(
        &self,
        payer: Address,
        requested_mb: f64,
        now: u64,
    ) -> Result<ConsumeDecision> {
        if !requested_mb.is_finite() || requested_mb < 0.0 {
            return Err(Error::Validation(
                "requested size must be a non-negative number".to_string(),
            ));
        }
        self.ledger
            .update(payer, |slot| {
                let Some(record) = slot.as_mut().filter(|r| r.is_active_at(now)) else {
                    return Ok(ConsumeDecision::denied());
                };
                let decision = ConsumeDecision::against(record.remaining_mb(), requested_mb);
                if decision.allowed {
                    record.used_mb += requested_mb;
                }
                Ok(decision)
            })
            .await
    }

    /// Compare tracked usage with `listing` and overwrite it on disagreement.
    ///
    /// The listing total is computed before the payer lock is taken.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the payer has no subscription record.
    pub async fn reconcile(&self, payer: Address, listing: &[StoredObject]) -> Result<ReconcileReport> {
        let real_mb = total_mb(listing);
        let tolerance = self.config.tolerance_mb;

        let report = self
            .ledger
            .update(payer, |slot| {
                let record = slot
                    .as_mut()
                    .ok_or_else(|| Error::NotFound(format!("subscription for {payer}")))?;
                let previous_mb = record.used_mb;
                let discrepancy = previous_mb - real_mb;
                let corrected = discrepancy.abs() > tolerance;
                if corrected {
                    record.used_mb = real_mb;
                }
                Ok(ReconcileReport {
                    payer,
                    previous_mb,
                    current_mb: if corrected { real_mb } else { previous_mb },
                    discrepancy,
                    corrected,
                })
            })
            .await?;

        if report.corrected {
            info!(
                "Corrected usage for {payer}: {:.3}MB -> {:.3}MB (discrepancy {:+.3}MB)",
                report.previous_mb, report.current_mb, report.discrepancy
            );
        } else {
            debug!("Usage for {payer} matches listing ({:.3}MB)", report.current_mb);
        }
        self.emit(&report);
        Ok(report)
    }

    /// Fetch the payer's listing and reconcile against it.
    ///
    /// A listing that exceeds the timeout counts as no discrepancy.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for payers without a record, or the lister's
    /// error if the listing fails outright.
    pub async fn sync_payer(&self, payer: Address) -> Result<ReconcileReport> {
        let record = self
            .ledger
            .get_record(&payer)
            .ok_or_else(|| Error::NotFound(format!("subscription for {payer}")))?;

        match tokio::time::timeout(self.config.listing_timeout, self.lister.list_objects(payer))
            .await
        {
            Ok(listing) => self.reconcile(payer, &listing?).await,
            Err(_) => {
                warn!(
                    "Object listing for {payer} timed out after {:?}, assuming no discrepancy",
                    self.config.listing_timeout
                );
                Ok(ReconcileReport {
                    payer,
                    previous_mb: record.used_mb,
                    current_mb: record.used_mb,
                    discrepancy: 0.0,
                    corrected: false,
                })
            }
        }
    }

    /// Reconcile every payer in the ledger with bounded concurrency.
    pub async fn sync_all(&self) -> SyncSummary {
        let payers = self.ledger.payers();
        let started = std::time::Instant::now();

        let results: Vec<_> = stream::iter(payers)
            .map(|payer| async move { (payer, self.sync_payer(payer).await) })
            .buffer_unordered(self.config.sync_concurrency.max(1))
            .collect()
            .await;

        let mut summary = SyncSummary::default();
        for (payer, result) in results {
            match result {
                Ok(report) => summary.reports.push(report),
                Err(e) => {
                    warn!("Usage sync for {payer} failed: {e}");
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Usage sync: {} payers checked, {} corrected, {} failed in {:?}",
            summary.reports.len(),
            summary.corrected(),
            summary.failed,
            started.elapsed()
        );
        summary
    }

    /// Set the payer's usage directly.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for negative or non-finite values and
    /// `Error::NotFound` for payers without a record.
    pub async fn override_usage(&self, payer: Address, used_mb: f64) -> Result<ReconcileReport> {
        if !used_mb.is_finite() || used_mb < 0.0 {
            return Err(Error::Validation(
                "usedMB must be a non-negative number".to_string(),
            ));
        }
        let report = self
            .ledger
            .update(payer, |slot| {
                let record = slot
                    .as_mut()
                    .ok_or_else(|| Error::NotFound(format!("subscription for {payer}")))?;
                let previous_mb = record.used_mb;
                record.used_mb = used_mb;
                Ok(ReconcileReport {
                    payer,
                    previous_mb,
                    current_mb: used_mb,
                    discrepancy: previous_mb - used_mb,
                    corrected: true,
                })
            })
            .await?;
        info!(
            "Usage for {payer} overridden: {:.3}MB -> {used_mb:.3}MB",
            report.previous_mb
        );
        Ok(report)
    }

    fn emit(&self, report: &ReconcileReport) {
        if let Some(ref events) = self.events {
            let _ = events.send(GatewayEvent::UsageReconciled {
                payer: report.payer,
                previous_mb: report.previous_mb,
                current_mb: report.current_mb,
                corrected: report.corrected,
            });
        }
    }
}
