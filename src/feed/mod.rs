//! Signed data feeds.
//!
//! Feeds are identified by `keccak256(name)` so any party can recompute the
//! id. Packets are signed with the node's ML-DSA-65 key and expire after a
//! fixed validity window.

mod registry;
pub mod signer;

pub use registry::{
    FeedAccessLog, FeedAccessRecord, FeedConfig, FeedDescriptor, FeedRegistry, FnProvider,
    StaticValue, ValueProvider, DEFAULT_ACCESS_LOG_CAPACITY,
};
pub use signer::{compute_feed_id, verify_packet, FeedSigner, SignedPacket, SIGNING_CONTEXT};
