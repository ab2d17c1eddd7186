//! E2E tests for paygate-node.
//!
//! Each test starts a real node on a loopback port and drives it over HTTP.
//! Settlement and object listing are in-process fakes; payments are signed
//! with fresh secp256k1 keys exactly as a wallet would sign them.
//!
//! ## Architecture
//!
//! ```text
//! TestGateway
//!     ├── RunningNode (axum on 127.0.0.1:0)
//!     ├── FakeSettlement (SettlementChannel)
//!     └── MemoryLister (ObjectLister)
//! ```

mod feed_flow;
mod harness;
mod settlement_flow;
mod storage_flow;

pub use harness::{GatewayOptions, TestGateway};
