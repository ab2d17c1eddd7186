//! Command-line interface definition.

use clap::{Parser, ValueEnum};
use paygate_node::config::GatewayConfig;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Payment-gated storage quota and signed data-feed node.
#[derive(Parser, Debug)]
#[command(name = "paygate-node")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Root directory for node data.
    #[arg(long, env = "PAYGATE_ROOT_DIR")]
    pub root_dir: Option<PathBuf>,

    /// HTTP listen address.
    #[arg(long, short, env = "PAYGATE_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Address that receives payments.
    #[arg(long, env = "PAYGATE_PAY_TO")]
    pub pay_to: Option<String>,

    /// Payment network name (e.g. base-sepolia).
    #[arg(long, env = "PAYGATE_NETWORK")]
    pub network: Option<String>,

    /// x402 facilitator base URL used for settlement.
    #[arg(long, env = "PAYGATE_FACILITATOR_URL")]
    pub facilitator_url: Option<String>,

    /// Reject requests whose settlement fails instead of granting them.
    #[arg(long, env = "PAYGATE_STRICT_SETTLEMENT")]
    pub strict_settlement: bool,

    /// Storage gateway base URL used for usage reconciliation.
    #[arg(long, env = "PAYGATE_STORAGE_GATEWAY")]
    pub storage_gateway: Option<String>,

    /// Global quota ceiling in MB.
    #[arg(long, env = "PAYGATE_GLOBAL_CAPACITY_MB")]
    pub global_capacity_mb: Option<u64>,

    /// Bearer secret for the admin routes.
    #[arg(long, env = "PAYGATE_ADMIN_SECRET", hide_env_values = true)]
    pub admin_secret: Option<String>,

    /// Bearer secret the storage service uses for upload and deletion calls.
    #[arg(long, env = "PAYGATE_STORAGE_SECRET", hide_env_values = true)]
    pub storage_secret: Option<String>,

    /// Log level.
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text", env = "PAYGATE_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Path to configuration file.
    #[arg(long, short)]
    pub config: Option<PathBuf>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

impl Cli {
    /// Convert CLI arguments into a `GatewayConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded.
    pub fn into_config(self) -> color_eyre::Result<GatewayConfig> {
        // Start with default config or load from file
        let mut config = if let Some(ref path) = self.config {
            GatewayConfig::from_file(path)?
        } else {
            GatewayConfig::default()
        };

        // Override with CLI arguments
        if let Some(root_dir) = self.root_dir {
            config.root_dir = root_dir;
        }
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(network) = self.network {
            config.payment.network = network;
            config.payment.chain_id = None;
        }
        if self.pay_to.is_some() {
            config.payment.pay_to = self.pay_to;
        }
        if self.facilitator_url.is_some() {
            config.settlement.facilitator_url = self.facilitator_url;
        }
        if self.strict_settlement {
            config.settlement.fail_open = false;
        }
        if self.storage_gateway.is_some() {
            config.reconciliation.gateway_url = self.storage_gateway;
        }
        if self.global_capacity_mb.is_some() {
            config.capacity.global_capacity_mb = self.global_capacity_mb;
        }
        if self.admin_secret.is_some() {
            config.admin_secret = self.admin_secret;
        }
        if self.storage_secret.is_some() {
            config.storage_secret = self.storage_secret;
        }
        config.log_level = self.log_level;

        Ok(config)
    }
}
