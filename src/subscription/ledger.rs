//! Per-payer subscription records.
//!
//! Committed records live in a map behind a short `parking_lot` lock so reads
//! never wait on writers for long. Every read-modify-write for a payer runs
//! under that payer's own async mutex, so concurrent purchases or usage
//! updates for one payer are serialized while different payers proceed
//! independently.
//!
//! A persistent ledger only marks itself dirty on commit. A background task
//! takes the snapshot and writes it on the blocking pool, coalescing bursts
//! of mutations into one write.

use crate::error::{Error, Result};
use crate::payment::{unix_now, Address, SettlementResult};
use crate::subscription::tier::{Tier, TierCatalog};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Once, Weak};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// Snapshot file name inside the gateway root directory.
pub const LEDGER_FILE_NAME: &str = "subscriptions.bin";

/// A payer's subscription. Absence of a record means no subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    /// Paying address.
    pub payer_id: Address,
    /// Most recently purchased tier.
    pub tier: String,
    /// Allocated quota, MB.
    #[serde(rename = "quotaMB")]
    pub quota_mb: u64,
    /// Tracked usage, MB.
    #[serde(rename = "usedMB")]
    pub used_mb: f64,
    /// Unix seconds the current term started.
    pub purchased_at: u64,
    /// Unix seconds the subscription lapses.
    pub expires_at: u64,
    /// Settlement of the most recent purchase.
    pub last_settlement: Option<SettlementResult>,
}

impl SubscriptionRecord {
    /// Whether the subscription is active at `now`.
    #[must_use]
    pub const fn is_active_at(&self, now: u64) -> bool {
        self.expires_at > now
    }

    /// Quota left, never negative.
    #[must_use]
    pub fn remaining_mb(&self) -> f64 {
        (self.quota_mb as f64 - self.used_mb).max(0.0)
    }
}

/// Status view returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    /// Whether a subscription exists and has not lapsed.
    pub active: bool,
    /// Tier id.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tier: Option<String>,
    /// Allocated quota, MB.
    #[serde(rename = "quotaMB", skip_serializing_if = "Option::is_none", default)]
    pub quota_mb: Option<u64>,
    /// Tracked usage, MB.
    #[serde(rename = "usedMB", skip_serializing_if = "Option::is_none", default)]
    pub used_mb: Option<f64>,
    /// Quota left, MB.
    #[serde(rename = "remainingMB", skip_serializing_if = "Option::is_none", default)]
    pub remaining_mb: Option<f64>,
    /// Expiry, unix seconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expires_at: Option<u64>,
}

impl SubscriptionStatus {
    /// Status of a payer with no record.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            active: false,
            tier: None,
            quota_mb: None,
            used_mb: None,
            remaining_mb: None,
            expires_at: None,
        }
    }

    fn of(record: &SubscriptionRecord, now: u64) -> Self {
        Self {
            active: record.is_active_at(now),
            tier: Some(record.tier.clone()),
            quota_mb: Some(record.quota_mb),
            used_mb: Some(record.used_mb),
            remaining_mb: Some(record.remaining_mb()),
            expires_at: Some(record.expires_at),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedLedger {
    records: Vec<SubscriptionRecord>,
}

type RecordMap = RwLock<HashMap<Address, SubscriptionRecord>>;

/// Writes ledger snapshots off the mutation path.
struct SnapshotWriter {
    path: PathBuf,
    /// Commits so far.
    generation: AtomicU64,
    /// Highest generation the writer has handled.
    written: watch::Sender<u64>,
    wake: Notify,
    started: Once,
    closed: AtomicBool,
    /// Generation in the file. Older snapshots are never written over it.
    on_disk: Mutex<u64>,
}

impl SnapshotWriter {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            generation: AtomicU64::new(0),
            written: watch::channel(0).0,
            wake: Notify::new(),
            started: Once::new(),
            closed: AtomicBool::new(false),
            on_disk: Mutex::new(0),
        }
    }

    fn mark_dirty(self: &Arc<Self>, records: &Arc<RecordMap>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.started.call_once(|| {
            tokio::spawn(Arc::clone(self).run(Arc::downgrade(records)));
        });
        self.wake.notify_one();
    }

    fn is_dirty(&self) -> bool {
        self.generation.load(Ordering::SeqCst) > *self.written.borrow()
    }

    async fn run(self: Arc<Self>, records: Weak<RecordMap>) {
        loop {
            self.wake.notified().await;
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            let Some(map) = records.upgrade() else {
                break;
            };
            if !self.is_dirty() {
                continue;
            }

            let generation = self.generation.load(Ordering::SeqCst);
            let snapshot = snapshot_of(&map);
            drop(map);

            let writer = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || writer.write(generation, &snapshot)).await {
                Ok(()) => debug!("Ledger snapshot {generation} written"),
                Err(e) => warn!("Ledger snapshot task failed: {e}"),
            }
            self.written.send_if_modified(|written| {
                let advanced = generation > *written;
                if advanced {
                    *written = generation;
                }
                advanced
            });
        }
    }

    fn write(&self, generation: u64, snapshot: &PersistedLedger) {
        let mut on_disk = self.on_disk.lock();
        if generation <= *on_disk {
            return;
        }
        match rmp_serde::to_vec_named(snapshot) {
            Ok(bytes) => {
                let tmp = self.path.with_extension("bin.tmp");
                let written =
                    std::fs::write(&tmp, bytes).and_then(|()| std::fs::rename(&tmp, &self.path));
                match written {
                    Ok(()) => *on_disk = generation,
                    Err(e) => warn!("Failed to persist subscription ledger: {e}"),
                }
            }
            Err(e) => warn!("Failed to encode subscription ledger: {e}"),
        }
    }
}

fn snapshot_of(records: &RecordMap) -> PersistedLedger {
    PersistedLedger {
        records: records.read().values().cloned().collect(),
    }
}

/// Owns every subscription record.
pub struct SubscriptionLedger {
    catalog: Arc<TierCatalog>,
    records: Arc<RecordMap>,
    payer_locks: Mutex<HashMap<Address, Arc<tokio::sync::Mutex<()>>>>,
    writer: Option<Arc<SnapshotWriter>>,
}

impl SubscriptionLedger {
    /// Create an in-memory ledger.
    #[must_use]
    pub fn new(catalog: Arc<TierCatalog>) -> Self {
        Self {
            catalog,
            records: Arc::new(RwLock::new(HashMap::new())),
            payer_locks: Mutex::new(HashMap::new()),
            writer: None,
        }
    }

    /// Create a ledger that snapshots to `path` in the background after
    /// mutations, loading any existing snapshot first.
    ///
    /// Mutations must run inside a tokio runtime, which hosts the writer.
    #[must_use]
    pub fn with_persistence(catalog: Arc<TierCatalog>, path: &Path) -> Self {
        let mut ledger = Self::new(catalog);
        ledger.writer = Some(Arc::new(SnapshotWriter::new(path.to_path_buf())));

        if let Some(loaded) = Self::load_from_disk(path) {
            let count = loaded.records.len();
            *ledger.records.write() = loaded
                .records
                .into_iter()
                .map(|r| (r.payer_id, r))
                .collect();
            info!("Loaded {count} subscription records from {}", path.display());
        }

        ledger
    }

    /// The tier catalog.
    #[must_use]
    pub fn catalog(&self) -> &TierCatalog {
        &self.catalog
    }

    /// Look up a tier.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for unknown tiers.
    pub fn tier(&self, tier_id: &str) -> Result<&Tier> {
        self.catalog.get(tier_id)
    }

    fn payer_lock(&self, payer: Address) -> Arc<tokio::sync::Mutex<()>> {
        self.payer_locks
            .lock()
            .entry(payer)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Run a read-modify-write on one payer's record under that payer's lock.
    ///
    /// `f` works on a copy; the copy is committed only if `f` returns `Ok`
    /// and changed it.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns.
    pub async fn update<T, F>(&self, payer: Address, f: F) -> Result<T>
    where
        F: FnOnce(&mut Option<SubscriptionRecord>) -> Result<T>,
    {
        let lock = self.payer_lock(payer);
        let _guard = lock.lock().await;

        let current = self.records.read().get(&payer).cloned();
        let mut working = current.clone();
        let out = f(&mut working)?;

        if working != current {
            {
                let mut records = self.records.write();
                match working {
                    Some(record) => {
                        records.insert(payer, record);
                    }
                    None => {
                        records.remove(&payer);
                    }
                }
            }
            if let Some(ref writer) = self.writer {
                writer.mark_dirty(&self.records);
            }
        }

        Ok(out)
    }

    /// Wait until every mutation committed so far is on disk. Returns at
    /// once for an in-memory ledger.
    pub async fn flush(&self) {
        let Some(ref writer) = self.writer else {
            return;
        };
        let target = writer.generation.load(Ordering::SeqCst);
        let mut written = writer.written.subscribe();
        writer.wake.notify_one();
        // The sender lives in `writer`, so this only ends once `target` is written.
        let _ = written.wait_for(|done| *done >= target).await;
    }

    /// Buy `tier_id` for `payer` now.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for unknown tiers.
    pub async fn purchase(
        &self,
        payer: Address,
        tier_id: &str,
        settlement: Option<SettlementResult>,
    ) -> Result<SubscriptionRecord> {
        self.purchase_at(payer, tier_id, settlement, unix_now()).await
    }

    /// Buy `tier_id` for `payer` as of `now`.
    ///
    /// An active subscription is extended from its current expiry and its
    /// quota grows by the tier's allocation. A lapsed or missing one starts
    /// fresh from `now` with zero usage.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for unknown tiers.
    pub async fn purchase_at(
        &self,
        payer: Address,
        tier_id: &str,
        settlement: Option<SettlementResult>,
        now: u64,
    ) -> Result<SubscriptionRecord> {
        let tier = self.catalog.get(tier_id)?.clone();
        self.update(payer, |slot| {
            let record = match slot.take() {
                Some(mut existing) if existing.is_active_at(now) => {
                    existing.expires_at = existing.expires_at.saturating_add(tier.validity_secs());
                    existing.quota_mb = existing.quota_mb.saturating_add(tier.quota_mb);
                    existing.tier.clone_from(&tier.id);
                    existing.last_settlement = settlement;
                    debug!(
                        "Renewed {payer} with {}: quota={}MB expires_at={}",
                        tier.id, existing.quota_mb, existing.expires_at
                    );
                    existing
                }
                _ => {
                    debug!("New subscription for {payer} on {}", tier.id);
                    SubscriptionRecord {
                        payer_id: payer,
                        tier: tier.id.clone(),
                        quota_mb: tier.quota_mb,
                        used_mb: 0.0,
                        purchased_at: now,
                        expires_at: now.saturating_add(tier.validity_secs()),
                        last_settlement: settlement,
                    }
                }
            };
            *slot = Some(record.clone());
            Ok(record)
        })
        .await
    }

    /// Renew an existing subscription as of `now`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the payer never subscribed or the tier is
    /// unknown.
    pub async fn renew_at(
        &self,
        payer: Address,
        tier_id: &str,
        settlement: Option<SettlementResult>,
        now: u64,
    ) -> Result<SubscriptionRecord> {
        if self.get_record(&payer).is_none() {
            return Err(Error::NotFound(format!("subscription for {payer}")));
        }
        self.purchase_at(payer, tier_id, settlement, now).await
    }

    /// A copy of the payer's record.
    #[must_use]
    pub fn get_record(&self, payer: &Address) -> Option<SubscriptionRecord> {
        self.records.read().get(payer).cloned()
    }

    /// Status of `payer` now.
    #[must_use]
    pub fn get_status(&self, payer: &Address) -> SubscriptionStatus {
        self.get_status_at(payer, unix_now())
    }

    /// Status of `payer` as of `now`.
    #[must_use]
    pub fn get_status_at(&self, payer: &Address, now: u64) -> SubscriptionStatus {
        self.records
            .read()
            .get(payer)
            .map_or_else(SubscriptionStatus::none, |r| SubscriptionStatus::of(r, now))
    }

    /// Every payer with a record.
    #[must_use]
    pub fn payers(&self) -> Vec<Address> {
        self.records.read().keys().copied().collect()
    }

    /// Sum of quota over subscriptions active at `now`, MB.
    #[must_use]
    pub fn allocated_quota_mb(&self, now: u64) -> u64 {
        self.records
            .read()
            .values()
            .filter(|r| r.is_active_at(now))
            .map(|r| r.quota_mb)
            .fold(0u64, u64::saturating_add)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no payer has a record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn load_from_disk(path: &Path) -> Option<PersistedLedger> {
        let bytes = std::fs::read(path).ok()?;
        match rmp_serde::from_slice(&bytes) {
            Ok(ledger) => Some(ledger),
            Err(e) => {
                warn!("Ignoring unreadable ledger snapshot {}: {e}", path.display());
                None
            }
        }
    }
}

impl Drop for SubscriptionLedger {
    fn drop(&mut self) {
        let Some(ref writer) = self.writer else {
            return;
        };
        if writer.is_dirty() {
            let generation = writer.generation.load(Ordering::SeqCst);
            writer.write(generation, &snapshot_of(&self.records));
            writer.written.send_replace(generation);
        }
        writer.closed.store(true, Ordering::SeqCst);
        writer.wake.notify_one();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::subscription::tier::SECS_PER_DAY;
    use tempfile::TempDir;

    const NOW: u64 = 1_760_000_000;

    fn ledger() -> SubscriptionLedger {
        SubscriptionLedger::new(Arc::new(TierCatalog::default()))
    }

    fn payer(n: u8) -> Address {
        Address::new([n; 20])
    }

    #[tokio::test]
    async fn test_first_purchase_creates_record() {
        let ledger = ledger();
        let record = ledger.purchase_at(payer(1), "basic", None, NOW).await.unwrap();

        assert_eq!(record.quota_mb, 1_000);
        assert!(record.used_mb.abs() < f64::EPSILON);
        assert_eq!(record.expires_at, NOW + 30 * SECS_PER_DAY);

        let status = ledger.get_status_at(&payer(1), NOW);
        assert!(status.active);
        assert_eq!(status.remaining_mb, Some(1_000.0));
    }

    #[tokio::test]
    async fn test_active_renewal_is_additive() {
        let ledger = ledger();
        let first = ledger.purchase_at(payer(1), "basic", None, NOW).await.unwrap();
        let later = NOW + 10 * SECS_PER_DAY;
        let renewed = ledger.purchase_at(payer(1), "basic", None, later).await.unwrap();

        assert_eq!(renewed.expires_at, first.expires_at + 30 * SECS_PER_DAY);
        assert_ne!(renewed.expires_at, later + 30 * SECS_PER_DAY);
        assert_eq!(renewed.quota_mb, 2_000);
    }

    #[tokio::test]
    async fn test_expired_purchase_starts_fresh() {
        let ledger = ledger();
        ledger.purchase_at(payer(1), "basic", None, NOW).await.unwrap();
        ledger
            .update(payer(1), |slot| {
                if let Some(r) = slot.as_mut() {
                    r.used_mb = 700.0;
                }
                Ok(())
            })
            .await
            .unwrap();

        let much_later = NOW + 31 * SECS_PER_DAY;
        assert!(!ledger.get_status_at(&payer(1), much_later).active);

        let fresh = ledger
            .purchase_at(payer(1), "standard", None, much_later)
            .await
            .unwrap();
        assert!(fresh.used_mb.abs() < f64::EPSILON);
        assert_eq!(fresh.quota_mb, 5_000);
        assert_eq!(fresh.expires_at, much_later + 30 * SECS_PER_DAY);
        assert_eq!(fresh.purchased_at, much_later);
    }

    #[tokio::test]
    async fn test_unknown_tier() {
        let ledger = ledger();
        let err = ledger.purchase_at(payer(1), "gold", None, NOW).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_renew_requires_record() {
        let ledger = ledger();
        assert!(ledger.renew_at(payer(1), "basic", None, NOW).await.is_err());
        ledger.purchase_at(payer(1), "basic", None, NOW).await.unwrap();
        let renewed = ledger.renew_at(payer(1), "basic", None, NOW).await.unwrap();
        assert_eq!(renewed.quota_mb, 2_000);
    }

    #[tokio::test]
    async fn test_status_without_record() {
        let status = ledger().get_status_at(&payer(9), NOW);
        assert_eq!(status, SubscriptionStatus::none());
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json, serde_json::json!({"active": false}));
    }

    #[tokio::test]
    async fn test_failed_update_not_committed() {
        let ledger = ledger();
        ledger.purchase_at(payer(1), "basic", None, NOW).await.unwrap();
        let result: Result<()> = ledger
            .update(payer(1), |slot| {
                if let Some(r) = slot.as_mut() {
                    r.used_mb = 5.0;
                }
                Err(Error::Validation("nope".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(ledger.get_record(&payer(1)).unwrap().used_mb.abs() < f64::EPSILON);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_purchases_serialized() {
        let ledger = Arc::new(ledger());
        ledger.purchase_at(payer(1), "basic", None, NOW).await.unwrap();

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                tokio::spawn(async move {
                    ledger.purchase_at(payer(1), "basic", None, NOW).await.unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let record = ledger.get_record(&payer(1)).unwrap();
        assert_eq!(record.quota_mb, 21_000);
        assert_eq!(record.expires_at, NOW + 21 * 30 * SECS_PER_DAY);
    }

    #[tokio::test]
    async fn test_allocated_quota_counts_active_only() {
        let ledger = ledger();
        ledger.purchase_at(payer(1), "basic", None, NOW).await.unwrap();
        ledger
            .purchase_at(payer(2), "standard", None, NOW - 40 * SECS_PER_DAY)
            .await
            .unwrap();
        assert_eq!(ledger.allocated_quota_mb(NOW), 1_000);
        assert_eq!(ledger.payers().len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);
        let catalog = Arc::new(TierCatalog::default());

        {
            let ledger = SubscriptionLedger::with_persistence(Arc::clone(&catalog), &path);
            let settlement = SettlementResult {
                success: true,
                transaction_ref: Some("0xabc".to_string()),
                network: "base-sepolia".to_string(),
                error_reason: None,
            };
            ledger
                .purchase_at(payer(1), "basic", Some(settlement), NOW)
                .await
                .unwrap();
        }

        let reloaded = SubscriptionLedger::with_persistence(catalog, &path);
        let record = reloaded.get_record(&payer(1)).expect("record persisted");
        assert_eq!(record.quota_mb, 1_000);
        assert_eq!(
            record.last_settlement.and_then(|s| s.transaction_ref),
            Some("0xabc".to_string())
        );
    }

    #[tokio::test]
    async fn test_flush_waits_for_background_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);
        let catalog = Arc::new(TierCatalog::default());

        let ledger = SubscriptionLedger::with_persistence(Arc::clone(&catalog), &path);
        ledger.flush().await;
        assert!(!path.exists());

        for n in 1..=5 {
            ledger.purchase_at(payer(n), "basic", None, NOW).await.unwrap();
        }
        ledger.flush().await;

        let reloaded = SubscriptionLedger::with_persistence(catalog, &path);
        assert_eq!(reloaded.len(), 5);
        assert_eq!(reloaded.get_record(&payer(3)), ledger.get_record(&payer(3)));
    }

    #[test]
    fn test_corrupt_snapshot_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);
        std::fs::write(&path, b"not msgpack").unwrap();
        let ledger = SubscriptionLedger::with_persistence(Arc::new(TierCatalog::default()), &path);
        assert!(ledger.is_empty());
    }
}
