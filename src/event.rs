//! Gateway event system.

use crate::payment::Address;
use tokio::sync::broadcast;

/// Events emitted by the gateway.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Gateway has started and is accepting requests.
    Started {
        /// Bound listen address.
        listen_addr: String,
    },

    /// Gateway is shutting down.
    ShuttingDown,

    /// A subscription was created or renewed.
    SubscriptionGranted {
        /// Paying address.
        payer: Address,
        /// Tier id.
        tier: String,
        /// Unix seconds the subscription now expires.
        expires_at: u64,
    },

    /// A verified payment could not be settled.
    SettlementFailed {
        /// Paying address.
        payer: Address,
        /// Authorization nonce.
        nonce: String,
        /// Channel error reason.
        reason: String,
    },

    /// Tracked usage was checked against the storage listing.
    UsageReconciled {
        /// Payer.
        payer: Address,
        /// Tracked MB before the check.
        previous_mb: f64,
        /// Listed MB.
        current_mb: f64,
        /// Whether the ledger was overwritten.
        corrected: bool,
    },

    /// A paid feed packet was released.
    FeedAccessed {
        /// Paying address.
        payer: Address,
        /// Feed name.
        feed_name: String,
    },

    /// Global utilisation crossed the warning threshold.
    CapacityWarning {
        /// Warning text.
        message: String,
    },

    /// Error occurred.
    Error {
        /// Error message.
        message: String,
    },
}

/// Channel for receiving gateway events.
pub type GatewayEventsChannel = broadcast::Receiver<GatewayEvent>;

/// Sender for gateway events.
pub type GatewayEventsSender = broadcast::Sender<GatewayEvent>;

/// Create a new event channel pair.
#[must_use]
pub fn create_event_channel() -> (GatewayEventsSender, GatewayEventsChannel) {
    broadcast::channel(256)
}
