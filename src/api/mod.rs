//! HTTP surface of the gateway.
//!
//! | Method | Path                               | Purpose                         |
//! |--------|------------------------------------|---------------------------------|
//! | GET    | `/health`                          | liveness                        |
//! | GET    | `/tiers`                           | tier catalog with availability  |
//! | POST   | `/subscriptions/:tier`             | buy or renew (x402)             |
//! | GET    | `/subscriptions/:payer`            | subscription status             |
//! | POST   | `/storage/:payer/uploads`          | admit an upload against quota   |
//! | POST   | `/storage/:payer/deletions`        | release quota                   |
//!
//! The `/storage` routes take `Authorization: Bearer <storage_secret>`, the
//! `/admin` routes `Authorization: Bearer <admin_secret>`.
//! | GET    | `/feeds`                           | feed descriptors and signer key |
//! | GET    | `/feeds/:name`                     | signed packet (x402)            |
//! | POST   | `/admin/usage-sync[/:payer]`       | reconcile against storage       |
//! | POST   | `/admin/usage-override/:payer`     | set usage directly              |

mod error;
pub mod payment_header;
mod routes;

pub use error::ApiError;
pub use payment_header::{X_PAYMENT, X_PAYMENT_RESPONSE};

use crate::protocol::ProtocolHandler;
use axum::routing::{get, post};
use axum::Router;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// State shared by every route.
#[derive(Clone)]
pub struct AppState {
    handler: Arc<ProtocolHandler>,
    admin_digest: Option<[u8; 32]>,
    storage_digest: Option<[u8; 32]>,
}

impl AppState {
    /// Wrap a handler. Admin routes stay closed when `admin_secret` is `None`.
    #[must_use]
    pub fn new(handler: Arc<ProtocolHandler>, admin_secret: Option<&str>) -> Self {
        Self {
            handler,
            admin_digest: admin_secret.map(digest),
            storage_digest: None,
        }
    }

    /// Open the storage routes to callers presenting `storage_secret`.
    #[must_use]
    pub fn with_storage_secret(mut self, storage_secret: Option<&str>) -> Self {
        self.storage_digest = storage_secret.map(digest);
        self
    }

    /// The protocol handler.
    #[must_use]
    pub fn handler(&self) -> &Arc<ProtocolHandler> {
        &self.handler
    }

    /// Whether `presented` matches the admin secret.
    fn admin_matches(&self, presented: &str) -> bool {
        secret_matches(self.admin_digest.as_ref(), presented)
    }

    /// Whether `presented` matches the storage service secret.
    fn storage_matches(&self, presented: &str) -> bool {
        secret_matches(self.storage_digest.as_ref(), presented)
    }
}

fn secret_matches(expected: Option<&[u8; 32]>, presented: &str) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    // Equal-length digests so the comparison time does not track the secret.
    digest(presented)
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

fn digest(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/tiers", get(routes::tiers))
        .route(
            "/subscriptions/:id",
            post(routes::purchase_subscription).get(routes::subscription_status),
        )
        .route("/storage/:payer/uploads", post(routes::admit_upload))
        .route("/storage/:payer/deletions", post(routes::release_upload))
        .route("/feeds", get(routes::list_feeds))
        .route("/feeds/:name", get(routes::fetch_feed))
        .route("/admin/usage-sync", post(routes::sync_all))
        .route("/admin/usage-sync/:payer", post(routes::sync_payer))
        .route("/admin/usage-override/:payer", post(routes::override_usage))
        .with_state(state)
}
