//! Payment verification and settlement for paygate-node.
//!
//! Payments use the x402 `exact` scheme: the payer signs an EIP-3009
//! `TransferWithAuthorization` for the stablecoin, and the node checks it
//! before finalizing it once.
//!
//! # Architecture
//!
//! ```text
//! PaymentPayload received
//!        │
//!        ▼
//! ┌─────────────────────┐
//! │ PaymentVerifier     │  scheme → network → recipient → amount
//! │ (pure, no state)    │  → time window → signature recovery
//! └─────────┬───────────┘
//!           │
//!    ┌──────┴──────┐
//!    │             │
//!  INVALID       VALID
//!    │             │
//!    ▼             ▼
//! 402 + reason  ┌──────────────────────┐
//!               │ SettlementExecutor   │  nonce cache (until expiry)
//!               │ (once per nonce)     │  → channel (timeout-bounded)
//!               └──────────────────────┘
//! ```

pub mod address;
mod cache;
pub mod eip712;
pub mod settlement;
pub mod types;
mod verifier;

pub use address::{is_valid_address, parse_address, Address};
pub use cache::{CacheStats, NonceWindow, SettlementCache};
pub use settlement::{
    FacilitatorChannel, SettlementChannel, SettlementConfig, SettlementExecutor,
    UnconfiguredChannel,
};
pub use types::{
    AssetExtra, Authorization, ExactPayload, InvalidReason, Nonce, PaymentPayload,
    PaymentRequired, PaymentRequirements, SettlementResult, VerificationResult, SCHEME_EXACT,
    X402_VERSION,
};
pub use verifier::{unix_now, PaymentPolicy, PaymentVerifier, PaymentVerifierConfig};
