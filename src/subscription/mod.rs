//! Subscriptions, usage metering and the global capacity gate.
//!
//! ```text
//! purchase ──► SubscriptionLedger ◄── UsageMeter ◄── ObjectLister
//!                     ▲                 (record / reconcile)
//!                     │
//!               CapacityGate (sum of active quota vs ceiling)
//! ```

mod capacity;
mod ledger;
mod meter;
mod tier;

pub use capacity::{CapacityDecision, CapacityGate, DEFAULT_WARNING_THRESHOLD};
pub use ledger::{SubscriptionLedger, SubscriptionRecord, SubscriptionStatus, LEDGER_FILE_NAME};
pub use meter::{ConsumeDecision, MeterConfig, ReconcileReport, SyncSummary, UsageMeter};
pub use tier::{default_tiers, Tier, TierCatalog, SECS_PER_DAY};
