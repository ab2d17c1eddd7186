//! Error types for paygate-node.

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in paygate-node.
///
/// Payment and settlement refusals are not errors: they travel as a
/// rejection outcome of the protocol handler. The first four variants are
/// shown to callers; the rest are infrastructure failures that the HTTP layer
/// reports generically.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request (missing fields, bad address format). Not retryable.
    #[error("validation error: {0}")]
    Validation(String),

    /// Not enough global capacity left for the requested allocation.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Unknown feed, tier or subscription.
    #[error("not found: {0}")]
    NotFound(String),

    /// Admin or storage service credential missing or wrong.
    #[error("unauthorized")]
    Unauthorized,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network error talking to a facilitator or storage gateway.
    #[error("network error: {0}")]
    Network(String),

    /// Storage error (ledger snapshot, object listing).
    #[error("storage error: {0}")]
    Storage(String),

    /// Cryptographic error.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Node is shutting down.
    #[error("node is shutting down")]
    ShuttingDown,
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
