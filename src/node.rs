//! Gateway node: wires configuration into a protocol handler and serves it.

use crate::api::{self, AppState};
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::event::{create_event_channel, GatewayEvent, GatewayEventsChannel, GatewayEventsSender};
use crate::feed::{
    FeedAccessLog, FeedConfig, FeedRegistry, FeedSigner, StaticValue, DEFAULT_ACCESS_LOG_CAPACITY,
};
use crate::payment::{
    FacilitatorChannel, PaymentVerifier, SettlementChannel, SettlementConfig, SettlementExecutor,
    UnconfiguredChannel,
};
use crate::protocol::{ProtocolComponents, ProtocolConfig, ProtocolHandler};
use crate::storage::{EmptyLister, GatewayLister, ObjectLister};
use crate::subscription::{CapacityGate, MeterConfig, SubscriptionLedger, UsageMeter};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

/// Builder for constructing a gateway node.
pub struct NodeBuilder {
    config: GatewayConfig,
    settlement_channel: Option<Arc<dyn SettlementChannel>>,
    lister: Option<Arc<dyn ObjectLister>>,
    signer: Option<FeedSigner>,
    extra_feeds: Vec<FeedConfig>,
}

impl NodeBuilder {
    /// Create a new node builder with the given configuration.
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            settlement_channel: None,
            lister: None,
            signer: None,
            extra_feeds: Vec::new(),
        }
    }

    /// Settle through `channel` instead of the configured facilitator.
    #[must_use]
    pub fn with_settlement_channel(mut self, channel: Arc<dyn SettlementChannel>) -> Self {
        self.settlement_channel = Some(channel);
        self
    }

    /// List stored objects through `lister` instead of the configured gateway.
    #[must_use]
    pub fn with_object_lister(mut self, lister: Arc<dyn ObjectLister>) -> Self {
        self.lister = Some(lister);
        self
    }

    /// Sign packets with `signer` instead of loading or generating keys.
    #[must_use]
    pub fn with_signer(mut self, signer: FeedSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Register a feed in addition to those in the configuration.
    #[must_use]
    pub fn with_feed(mut self, feed: FeedConfig) -> Self {
        self.extra_feeds.push(feed);
        self
    }

    /// Build the node and bind its listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, keys cannot be
    /// loaded or the listen address cannot be bound.
    pub async fn build(self) -> Result<RunningNode> {
        // Config holds the admin and storage secrets; never log it whole.
        info!(
            "Building paygate-node (root_dir={}, listen={}, network={})",
            self.config.root_dir.display(),
            self.config.listen_addr,
            self.config.payment.network
        );
        self.config.validate()?;

        // Ensure root directory exists
        std::fs::create_dir_all(&self.config.root_dir)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = create_event_channel();

        let catalog = Arc::new(self.config.tier_catalog()?);
        let ledger = Arc::new(SubscriptionLedger::with_persistence(
            Arc::clone(&catalog),
            &self.config.ledger_path(),
        ));

        let reconciliation = &self.config.reconciliation;
        let lister: Arc<dyn ObjectLister> = match (self.lister, &reconciliation.gateway_url) {
            (Some(lister), _) => lister,
            (None, Some(url)) => Arc::new(GatewayLister::new(url, reconciliation.timeout())?),
            (None, None) => {
                warn!("No storage gateway configured, usage reconciliation is disabled");
                Arc::new(EmptyLister)
            }
        };
        let meter = Arc::new(
            UsageMeter::new(
                Arc::clone(&ledger),
                lister,
                MeterConfig {
                    tolerance_mb: reconciliation.tolerance_mb,
                    listing_timeout: reconciliation.timeout(),
                    sync_concurrency: reconciliation.concurrency,
                },
            )
            .with_events(events_tx.clone()),
        );

        let settlement_cfg = &self.config.settlement;
        let channel: Arc<dyn SettlementChannel> =
            match (self.settlement_channel, &settlement_cfg.facilitator_url) {
                (Some(channel), _) => channel,
                (None, Some(url)) => Arc::new(FacilitatorChannel::new(url, settlement_cfg.timeout())?),
                (None, None) => {
                    warn!("No facilitator configured, every settlement will fail");
                    Arc::new(UnconfiguredChannel)
                }
            };
        let settlement = Arc::new(SettlementExecutor::new(
            channel,
            SettlementConfig {
                timeout: settlement_cfg.timeout(),
                cache_capacity: settlement_cfg.cache_capacity,
            },
        ));

        let signer = match self.signer {
            Some(signer) => signer,
            None => load_signer(&self.config)?,
        };
        info!("Feed signer fingerprint: {}", signer.public_key_fingerprint());

        let feeds = Arc::new(FeedRegistry::new());
        for spec in &self.config.feed {
            let mut feed = FeedConfig::new(
                &spec.name,
                &spec.data_type,
                &spec.schema,
                spec.price_atomic,
                Arc::new(StaticValue(spec.value.clone())),
            )
            .with_update_freq(spec.update_freq_secs);
            feed.active = spec.active;
            feeds.register(feed)?;
        }
        for feed in self.extra_feeds {
            feeds.register(feed)?;
        }

        let gate = CapacityGate::new(Arc::clone(&catalog))
            .with_warning_threshold(self.config.capacity.warning_threshold)?;

        let protocol = ProtocolConfig {
            terms: self.config.payment.terms()?,
            fail_open: settlement_cfg.fail_open,
            global_capacity_mb: self.config.capacity.global_capacity_mb,
            feed_validity_secs: self.config.feeds.default_validity_secs,
            grant_cache_capacity: settlement_cfg.cache_capacity,
        };
        let handler = Arc::new(
            ProtocolHandler::new(
                protocol,
                ProtocolComponents {
                    verifier: PaymentVerifier::new(self.config.payment.verifier_config()?),
                    settlement,
                    ledger,
                    meter,
                    gate,
                    feeds,
                    signer: Arc::new(signer),
                    access_log: Arc::new(FeedAccessLog::new(DEFAULT_ACCESS_LOG_CAPACITY)),
                },
            )
            .with_events(events_tx.clone()),
        );

        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|e| {
                Error::Network(format!("failed to bind {}: {e}", self.config.listen_addr))
            })?;
        let local_addr = listener.local_addr()?;
        info!("Bound HTTP listener on {local_addr}");

        Ok(RunningNode {
            config: self.config,
            handler,
            listener: Some(listener),
            local_addr,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            events_tx,
            events_rx: Some(events_rx),
        })
    }
}

fn load_signer(config: &GatewayConfig) -> Result<FeedSigner> {
    match (&config.feeds.signing_key_path, &config.feeds.public_key_path) {
        (Some(secret), Some(public)) => FeedSigner::from_files(secret, public),
        _ => {
            warn!("No feed signing key configured, generating an ephemeral key pair");
            FeedSigner::generate()
        }
    }
}

/// A gateway node with a bound listener.
pub struct RunningNode {
    config: GatewayConfig,
    handler: Arc<ProtocolHandler>,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    events_tx: GatewayEventsSender,
    events_rx: Option<GatewayEventsChannel>,
}

impl RunningNode {
    /// Get the node's root directory.
    #[must_use]
    pub fn root_dir(&self) -> &PathBuf {
        &self.config.root_dir
    }

    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The protocol handler behind the HTTP routes.
    #[must_use]
    pub fn handler(&self) -> &Arc<ProtocolHandler> {
        &self.handler
    }

    /// Get a receiver for node events.
    ///
    /// Note: Can only be called once. Subsequent calls return None.
    pub fn events(&mut self) -> Option<GatewayEventsChannel> {
        self.events_rx.take()
    }

    /// Subscribe to node events.
    #[must_use]
    pub fn subscribe_events(&self) -> GatewayEventsChannel {
        self.events_tx.subscribe()
    }

    /// A handle that stops the node from another task.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<watch::Sender<bool>> {
        Arc::clone(&self.shutdown_tx)
    }

    /// Serve requests until shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the node was already run or the server fails.
    pub async fn run(&mut self) -> Result<()> {
        let listener = self.listener.take().ok_or(Error::ShuttingDown)?;
        info!("Starting paygate-node on {}", self.local_addr);

        // Emit started event
        let _ = self.events_tx.send(GatewayEvent::Started {
            listen_addr: self.local_addr.to_string(),
        });

        if let Some(interval) = self.config.reconciliation.interval() {
            self.spawn_reconciliation(interval);
        }

        let state = AppState::new(Arc::clone(&self.handler), self.config.admin_secret.as_deref())
            .with_storage_secret(self.config.storage_secret.as_deref());
        let mut shutdown_rx = self.shutdown_rx.clone();
        let shutdown_tx = Arc::clone(&self.shutdown_tx);
        let shutdown = async move {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    info!("Shutdown signal received");
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received, initiating shutdown");
                    let _ = shutdown_tx.send(true);
                }
            }
        };

        let served = axum::serve(listener, api::router(state))
            .with_graceful_shutdown(shutdown)
            .await;

        let _ = self.events_tx.send(GatewayEvent::ShuttingDown);
        self.handler.ledger().flush().await;
        if let Err(ref e) = served {
            let _ = self.events_tx.send(GatewayEvent::Error {
                message: format!("HTTP server failed: {e}"),
            });
        }
        served.map_err(|e| Error::Network(format!("HTTP server failed: {e}")))?;
        info!("Node shutdown complete");
        Ok(())
    }

    fn spawn_reconciliation(&self, interval: std::time::Duration) {
        let meter = Arc::clone(self.handler.meter());
        let mut shutdown_rx = self.shutdown_rx.clone();
        info!("Usage reconciliation every {interval:?}");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip it so startup stays quiet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = wait_for_shutdown(&mut shutdown_rx) => break,
                    _ = ticker.tick() => {
                        meter.sync_all().await;
                    }
                }
            }
        });
    }

    /// Request the node to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
