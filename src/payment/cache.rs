//! Nonce-keyed stores that remember each authorization until it expires.
//!
//! An entry is dropped only after its `validBefore` has passed, at which
//! point the verifier already refuses the authorization as expired. A nonce
//! that can still be spent is therefore never forgotten, however many other
//! nonces arrive in the meantime.
//!
//! [`SettlementCache`] maps each nonce to a shared once-cell, so concurrent
//! settlement attempts for the same authorization (including client retries
//! after a timeout) await a single execution and all observe the same result.

use crate::payment::types::{Nonce, SettlementResult};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Default number of nonces preallocated (100,000).
pub const DEFAULT_CACHE_CAPACITY: usize = 100_000;

/// Values keyed by nonce, each held until its authorization's `validBefore`.
#[derive(Debug)]
pub struct NonceWindow<V> {
    entries: HashMap<Nonce, (u64, V)>,
    expiries: BinaryHeap<Reverse<(u64, Nonce)>>,
}

impl<V> NonceWindow<V> {
    /// Create a window with room for `capacity` nonces before it reallocates.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            expiries: BinaryHeap::with_capacity(capacity),
        }
    }

    /// Drop every entry whose `validBefore` is earlier than `now`.
    pub fn prune(&mut self, now: u64) {
        while let Some(Reverse((valid_before, nonce))) = self.expiries.peek().copied() {
            if valid_before >= now {
                break;
            }
            self.expiries.pop();
            self.entries.remove(&nonce);
        }
    }

    /// The value for `nonce`, inserting `make()` if absent.
    ///
    /// Expired entries are pruned first. Returns the value and whether it
    /// already existed.
    pub fn get_or_insert_with(
        &mut self,
        nonce: Nonce,
        valid_before: u64,
        now: u64,
        make: impl FnOnce() -> V,
    ) -> (&V, bool) {
        self.prune(now);
        let hit = self.entries.contains_key(&nonce);
        if !hit {
            self.expiries.push(Reverse((valid_before, nonce)));
        }
        let (_, value) = self
            .entries
            .entry(nonce)
            .or_insert_with(|| (valid_before, make()));
        (value, hit)
    }

    /// The value for `nonce`, if held.
    #[must_use]
    pub fn get(&self, nonce: &Nonce) -> Option<&V> {
        self.entries.get(nonce).map(|(_, value)| value)
    }

    /// Number of nonces held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no nonce is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A settlement slot: empty until the first attempt for the nonce finishes.
pub type SettlementSlot = Arc<OnceCell<SettlementResult>>;

/// Settlement slots held until their authorization expires.
#[derive(Clone)]
pub struct SettlementCache {
    inner: Arc<Mutex<NonceWindow<SettlementSlot>>>,
    stats: Arc<Mutex<CacheStats>>,
}

/// Cache statistics for monitoring.
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    /// Lookups that found an existing slot.
    pub hits: u64,
    /// Lookups that created a new slot.
    pub misses: u64,
}

impl CacheStats {
    /// Calculate hit rate as a percentage.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

impl SettlementCache {
    /// Create a new cache with the default preallocation.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    /// Create a new cache preallocated for `capacity` nonces.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NonceWindow::with_capacity(capacity))),
            stats: Arc::new(Mutex::new(CacheStats::default())),
        }
    }

    /// Get the slot for `nonce`, creating an empty one held until
    /// `valid_before` if absent.
    ///
    /// Returns the slot and whether it already existed.
    pub fn slot(&self, nonce: Nonce, valid_before: u64, now: u64) -> (SettlementSlot, bool) {
        let (slot, hit) = {
            let mut window = self.inner.lock();
            let (slot, hit) =
                window.get_or_insert_with(nonce, valid_before, now, || Arc::new(OnceCell::new()));
            (Arc::clone(slot), hit)
        };

        let mut stats = self.stats.lock();
        if hit {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }

        (slot, hit)
    }

    /// The settled result for `nonce`, if settlement already completed.
    #[must_use]
    pub fn get(&self, nonce: &Nonce) -> Option<SettlementResult> {
        self.inner
            .lock()
            .get(nonce)
            .and_then(|slot| slot.get().cloned())
    }

    /// Get current cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }

    /// Get the current number of entries in the cache.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for SettlementCache {
    fn default() -> Self {
        Self::new()
    }
}
