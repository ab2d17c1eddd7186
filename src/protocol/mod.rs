//! The payment-gated access protocol.
//!
//! ```text
//! NoPayment ──► Challenged ──► Verifying ──► Rejected
//!     │                            │
//!     │ (free)                     ▼
//!     │                        Verified ──► Settling ──► Granted
//!     └──────────────► Granted                 │
//!                                              ├──► GrantedWithSettlementFailure (fail-open)
//!                                              └──► Rejected (strict)
//! ```

mod challenge;
mod handler;
mod state;

pub use challenge::{Challenge, PaymentTerms, RejectReason, Rejection};
pub use handler::{
    Handled, Outcome, ProtocolComponents, ProtocolConfig, ProtocolHandler, TierAvailability,
    TierCatalogView,
};
pub use state::{FlowTrace, ProtocolState};
