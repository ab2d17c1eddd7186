//! # paygate-node
//!
//! A payment-gated node that sells storage quota and signed data-feed
//! packets over HTTP using the x402 "402 Payment Required" handshake.
//!
//! This crate provides:
//! - Verification of EIP-3009 stablecoin authorizations (`exact` scheme)
//! - Settlement that runs at most once per authorization nonce
//! - Subscription tiers with quota, expiry and a global capacity ceiling
//! - Usage metering reconciled against the storage gateway's listing
//! - ML-DSA-65 signed feed packets with a bounded validity window
//!
//! ## Architecture
//!
//! Every paid request goes through [`ProtocolHandler`]:
//! - no payment: a 402 challenge describing what to pay
//! - invalid payment: a 402 rejection with the reason
//! - valid payment: settlement, then the resource is released
//!
//! Settlement failure either still grants the resource (fail-open) or is
//! rejected (strict), depending on configuration.
//!
//! ## Example
//!
//! ```rust,no_run
//! use paygate_node::{GatewayConfig, NodeBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = GatewayConfig::default();
//!     config.payment.pay_to = Some("0x209693Bc6afc0C5328bA36FaF03C514EF312287C".into());
//!     let mut node = NodeBuilder::new(config).build().await?;
//!     node.run().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod api;
pub mod config;
pub mod error;
pub mod event;
pub mod feed;
pub mod node;
pub mod payment;
pub mod protocol;
pub mod storage;
pub mod subscription;

pub use config::GatewayConfig;
pub use error::{Error, Result};
pub use event::{GatewayEvent, GatewayEventsChannel};
pub use feed::{FeedConfig, FeedRegistry, FeedSigner, SignedPacket};
pub use node::{NodeBuilder, RunningNode};
pub use payment::{
    Address, PaymentPayload, PaymentRequirements, PaymentVerifier, SettlementExecutor,
    SettlementResult,
};
pub use protocol::{Challenge, Outcome, ProtocolHandler, ProtocolState, Rejection};
pub use subscription::{CapacityGate, SubscriptionLedger, TierCatalog, UsageMeter};
