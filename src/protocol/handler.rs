//! The end-to-end challenge/response flow.

use crate::error::{Error, Result};
use crate::event::{GatewayEvent, GatewayEventsSender};
use crate::feed::{FeedAccessLog, FeedAccessRecord, FeedRegistry, FeedSigner, SignedPacket};
use crate::payment::{
    unix_now, Address, InvalidReason, NonceWindow, PaymentPayload, PaymentPolicy,
    PaymentRequirements, PaymentVerifier, SettlementExecutor, SettlementResult,
};
use crate::protocol::challenge::{Challenge, PaymentTerms, RejectReason, Rejection};
use crate::protocol::state::{FlowTrace, ProtocolState};
use crate::storage::bytes_to_mb;
use crate::subscription::{
    CapacityDecision, CapacityGate, ConsumeDecision, SubscriptionLedger, SubscriptionRecord,
    SubscriptionStatus, Tier, UsageMeter,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

const JSON_MIME: &str = "application/json";

/// Protocol policy knobs.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Payment network, recipient and asset.
    pub terms: PaymentTerms,
    /// Grant even when settlement fails.
    pub fail_open: bool,
    /// Global quota ceiling, MB. `None` is unlimited.
    pub global_capacity_mb: Option<u64>,
    /// Validity of signed feed packets.
    pub feed_validity_secs: u64,
    /// Nonces preallocated for replay protection. Granted nonces are kept
    /// until their authorization expires.
    pub grant_cache_capacity: usize,
}

/// The collaborators a handler composes.
pub struct ProtocolComponents {
    /// Payment checks.
    pub verifier: PaymentVerifier,
    /// Exactly-once settlement.
    pub settlement: Arc<SettlementExecutor>,
    /// Subscription records.
    pub ledger: Arc<SubscriptionLedger>,
    /// Usage tracking.
    pub meter: Arc<UsageMeter>,
    /// Global capacity.
    pub gate: CapacityGate,
    /// Feed definitions.
    pub feeds: Arc<FeedRegistry>,
    /// Packet signer.
    pub signer: Arc<FeedSigner>,
    /// Paid access log.
    pub access_log: Arc<FeedAccessLog>,
}

/// How a request ended.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// No payment attached; here is what to pay.
    Challenged(Box<Challenge>),
    /// Payment refused.
    Rejected(Box<Rejection>),
    /// Resource released. `settlement` is `None` for free resources.
    Granted {
        /// The released resource.
        resource: T,
        /// Settlement of the payment.
        settlement: Option<SettlementResult>,
    },
    /// Resource released although settlement failed.
    GrantedWithSettlementFailure {
        /// The released resource.
        resource: T,
        /// The failed settlement.
        settlement: SettlementResult,
    },
}

impl<T> Outcome<T> {
    /// The released resource, if any.
    #[must_use]
    pub fn resource(&self) -> Option<&T> {
        match self {
            Self::Granted { resource, .. } | Self::GrantedWithSettlementFailure { resource, .. } => {
                Some(resource)
            }
            Self::Challenged(_) | Self::Rejected(_) => None,
        }
    }

    /// The settlement, if one ran.
    #[must_use]
    pub fn settlement(&self) -> Option<&SettlementResult> {
        match self {
            Self::Granted { settlement, .. } => settlement.as_ref(),
            Self::GrantedWithSettlementFailure { settlement, .. } => Some(settlement),
            Self::Challenged(_) | Self::Rejected(_) => None,
        }
    }
}

/// An outcome with the states the request went through.
#[derive(Debug, Clone)]
pub struct Handled<T> {
    /// Final outcome.
    pub outcome: Outcome<T>,
    /// Visited states.
    pub trace: FlowTrace,
}

impl<T> Handled<T> {
    /// Final state.
    #[must_use]
    pub fn state(&self) -> ProtocolState {
        self.trace.current()
    }
}

/// A tier with its current availability.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierAvailability {
    /// The tier.
    #[serde(flatten)]
    pub tier: Tier,
    /// Whether it can be bought right now.
    pub available: bool,
    /// Why not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Tier listing with the capacity picture.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierCatalogView {
    /// Every tier.
    pub tiers: Vec<TierAvailability>,
    /// Quota allocated to active subscriptions, MB.
    #[serde(rename = "allocatedMB")]
    pub allocated_mb: u64,
    /// Ceiling, MB. Absent when unlimited.
    #[serde(rename = "capacityMB", skip_serializing_if = "Option::is_none")]
    pub capacity_mb: Option<u64>,
    /// Utilisation notice.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

struct Paid {
    payer: Address,
    amount: u128,
    settlement: SettlementResult,
}

/// Quota held for a purchase between admission and the ledger commit.
struct CapacityReservation<'a> {
    reserved_mb: &'a Mutex<u64>,
    quota_mb: u64,
}

impl Drop for CapacityReservation<'_> {
    fn drop(&mut self) {
        let mut reserved = self.reserved_mb.lock();
        *reserved = reserved.saturating_sub(self.quota_mb);
    }
}

/// Composes verification, settlement, the ledger, the meter and the feed
/// signer into one flow per request.
pub struct ProtocolHandler {
    config: ProtocolConfig,
    verifier: PaymentVerifier,
    settlement: Arc<SettlementExecutor>,
    ledger: Arc<SubscriptionLedger>,
    meter: Arc<UsageMeter>,
    gate: CapacityGate,
    feeds: Arc<FeedRegistry>,
    signer: Arc<FeedSigner>,
    access_log: Arc<FeedAccessLog>,
    granted_nonces: Mutex<NonceWindow<()>>,
    reserved_mb: Mutex<u64>,
    events: Option<GatewayEventsSender>,
}

impl ProtocolHandler {
    /// Assemble a handler.
    #[must_use]
    pub fn new(config: ProtocolConfig, components: ProtocolComponents) -> Self {
        let grant_capacity = config.grant_cache_capacity;
        info!(
            "Protocol handler ready (network={}, pay_to={}, fail_open={}, capacity={})",
            config.terms.network,
            config.terms.pay_to,
            config.fail_open,
            config
                .global_capacity_mb
                .map_or_else(|| "unlimited".to_string(), |c| format!("{c}MB"))
        );
        if !config.fail_open {
            info!("Strict settlement: failed settlements will be rejected");
        }
        Self {
            config,
            verifier: components.verifier,
            settlement: components.settlement,
            ledger: components.ledger,
            meter: components.meter,
            gate: components.gate,
            feeds: components.feeds,
            signer: components.signer,
            access_log: components.access_log,
            granted_nonces: Mutex::new(NonceWindow::with_capacity(grant_capacity)),
            reserved_mb: Mutex::new(0),
            events: None,
        }
    }

    /// Emit gateway events on `sender`.
    #[must_use]
    pub fn with_events(mut self, sender: GatewayEventsSender) -> Self {
        self.events = Some(sender);
        self
    }

    /// Policy in force.
    #[must_use]
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Subscription ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<SubscriptionLedger> {
        &self.ledger
    }

    /// Usage meter.
    #[must_use]
    pub fn meter(&self) -> &Arc<UsageMeter> {
        &self.meter
    }

    /// Feed registry.
    #[must_use]
    pub fn feeds(&self) -> &Arc<FeedRegistry> {
        &self.feeds
    }

    /// Feed signer.
    #[must_use]
    pub fn signer(&self) -> &Arc<FeedSigner> {
        &self.signer
    }

    /// Paid feed access log.
    #[must_use]
    pub fn access_log(&self) -> &Arc<FeedAccessLog> {
        &self.access_log
    }

    /// Settlement executor.
    #[must_use]
    pub fn settlement(&self) -> &Arc<SettlementExecutor> {
        &self.settlement
    }

    /// Requirements for buying `tier`.
    #[must_use]
    pub fn subscription_requirements(&self, tier: &Tier) -> PaymentRequirements {
        self.config.terms.requirements(
            tier.price_atomic,
            &format!("/subscriptions/{}", tier.id),
            format!(
                "Storage subscription {}: {}MB for {} days",
                tier.id, tier.quota_mb, tier.validity_days
            ),
            JSON_MIME,
        )
    }

    /// Capacity decision for `tier_id` as of `now`.
    ///
    /// Quota held by purchases still settling counts as allocated.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for unknown tiers.
    pub fn check_capacity_at(&self, tier_id: &str, now: u64) -> Result<CapacityDecision> {
        let reserved = self.reserved_mb.lock();
        self.gate.can_accept_new_subscription(
            tier_id,
            self.ledger.allocated_quota_mb(now).saturating_add(*reserved),
            self.config.global_capacity_mb,
        )
    }

    /// Check capacity for `tier` and, if it fits, hold its quota until the
    /// returned reservation drops. Check and hold happen under one lock.
    fn reserve_capacity_at(
        &self,
        tier: &Tier,
        now: u64,
    ) -> Result<(CapacityDecision, Option<CapacityReservation<'_>>)> {
        let mut reserved = self.reserved_mb.lock();
        let decision = self.gate.can_accept_new_subscription(
            &tier.id,
            self.ledger.allocated_quota_mb(now).saturating_add(*reserved),
            self.config.global_capacity_mb,
        )?;
        if !decision.allowed {
            return Ok((decision, None));
        }
        *reserved = reserved.saturating_add(tier.quota_mb);
        Ok((
            decision,
            Some(CapacityReservation {
                reserved_mb: &self.reserved_mb,
                quota_mb: tier.quota_mb,
            }),
        ))
    }

    /// Buy or renew a subscription.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown tiers, `CapacityExceeded` when the tier does not
    /// fit. Payment problems are an `Outcome::Rejected`, not an error.
    pub async fn handle_subscription(
        &self,
        tier_id: &str,
        payment: Option<&PaymentPayload>,
    ) -> Result<Handled<SubscriptionRecord>> {
        self.handle_subscription_at(tier_id, payment, unix_now()).await
    }

    /// [`Self::handle_subscription`] as of `now`.
    ///
    /// # Errors
    ///
    /// See [`Self::handle_subscription`].
    pub async fn handle_subscription_at(
        &self,
        tier_id: &str,
        payment: Option<&PaymentPayload>,
        now: u64,
    ) -> Result<Handled<SubscriptionRecord>> {
        let tier = self.ledger.tier(tier_id)?.clone();
        let (decision, reservation) = if payment.is_some() {
            self.reserve_capacity_at(&tier, now)?
        } else {
            (self.check_capacity_at(&tier.id, now)?, None)
        };
        if !decision.allowed {
            let reason = decision
                .reason
                .unwrap_or_else(|| format!("no capacity for tier {}", tier.id));
            info!("Refusing subscription to {}: {reason}", tier.id);
            return Err(Error::CapacityExceeded(reason));
        }
        if let Some(ref warning) = decision.warning {
            warn!("{warning}");
            self.emit(GatewayEvent::CapacityWarning {
                message: warning.clone(),
            });
        }

        let requirements = self.subscription_requirements(&tier);
        let resource = requirements.resource.clone();

        let Some(payload) = payment else {
            let mut trace = FlowTrace::start(resource, ProtocolState::NoPayment);
            trace.advance(ProtocolState::Challenged);
            let challenge = Challenge::new(requirements).with_warning(decision.warning);
            return Ok(Handled {
                outcome: Outcome::Challenged(Box::new(challenge)),
                trace,
            });
        };

        let mut trace = FlowTrace::start(resource, ProtocolState::Challenged);
        let paid = match self.collect(payload, &requirements, &mut trace, now).await {
            Ok(paid) => paid,
            Err(rejection) => {
                return Ok(Handled {
                    outcome: Outcome::Rejected(rejection),
                    trace,
                })
            }
        };

        let record = self
            .ledger
            .purchase_at(paid.payer, &tier.id, Some(paid.settlement.clone()), now)
            .await?;
        // The committed quota is now part of the allocation.
        drop(reservation);
        info!(
            "Granted {} to {} ({}MB, expires_at={})",
            tier.id, paid.payer, record.quota_mb, record.expires_at
        );
        self.emit(GatewayEvent::SubscriptionGranted {
            payer: paid.payer,
            tier: tier.id.clone(),
            expires_at: record.expires_at,
        });

        Ok(Self::finish(trace, record, paid.settlement))
    }

    /// Fetch a feed packet.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown or inactive feeds, or the value provider's or
    /// signer's error.
    pub async fn handle_feed(
        &self,
        feed_name: &str,
        payment: Option<&PaymentPayload>,
    ) -> Result<Handled<SignedPacket>> {
        self.handle_feed_at(feed_name, payment, unix_now()).await
    }

    /// [`Self::handle_feed`] as of `now`.
    ///
    /// # Errors
    ///
    /// See [`Self::handle_feed`].
    pub async fn handle_feed_at(
        &self,
        feed_name: &str,
        payment: Option<&PaymentPayload>,
        now: u64,
    ) -> Result<Handled<SignedPacket>> {
        let feed = self
            .feeds
            .get_by_name(feed_name)
            .filter(|f| f.active)
            .ok_or_else(|| Error::NotFound(format!("feed {feed_name}")))?;
        let resource = format!("/feeds/{}", feed.name);

        let value = feed.value_provider.current_value().await?;
        let packet = self.signer.sign_packet_at(
            &feed.name,
            value,
            &feed.schema,
            self.config.feed_validity_secs,
            now,
        )?;

        if feed.is_free() {
            let mut trace = FlowTrace::start(resource, ProtocolState::NoPayment);
            trace.advance(ProtocolState::Granted);
            return Ok(Handled {
                outcome: Outcome::Granted {
                    resource: packet,
                    settlement: None,
                },
                trace,
            });
        }

        let requirements = self.config.terms.requirements(
            feed.price_atomic,
            &resource,
            format!("Signed {} packet for feed {}", feed.data_type, feed.name),
            JSON_MIME,
        );

        let Some(payload) = payment else {
            let mut trace = FlowTrace::start(resource, ProtocolState::NoPayment);
            trace.advance(ProtocolState::Challenged);
            let challenge = Challenge::new(requirements).with_packet(packet);
            return Ok(Handled {
                outcome: Outcome::Challenged(Box::new(challenge)),
                trace,
            });
        };

        let mut trace = FlowTrace::start(resource, ProtocolState::Challenged);
        let paid = match self.collect(payload, &requirements, &mut trace, now).await {
            Ok(paid) => paid,
            Err(rejection) => {
                return Ok(Handled {
                    outcome: Outcome::Rejected(rejection),
                    trace,
                })
            }
        };

        self.access_log.append(FeedAccessRecord {
            payer: paid.payer,
            feed_id: feed.feed_id.clone(),
            feed_name: feed.name.clone(),
            amount: paid.amount.to_string(),
            transaction_ref: paid.settlement.transaction_ref.clone(),
            settled: paid.settlement.success,
            timestamp: now,
        });
        self.emit(GatewayEvent::FeedAccessed {
            payer: paid.payer,
            feed_name: feed.name.clone(),
        });
        info!("Released {} packet to {}", feed.name, paid.payer);

        Ok(Self::finish(trace, packet, paid.settlement))
    }

    /// Admit an upload of `size_bytes` against the payer's quota, recording
    /// the usage if it fits.
    ///
    /// # Errors
    ///
    /// Returns the ledger's error.
    pub async fn admit_upload(&self, payer: Address, size_bytes: u64) -> Result<ConsumeDecision> {
        self.admit_upload_at(payer, size_bytes, unix_now()).await
    }

    /// [`Self::admit_upload`] as of `now`.
    ///
    /// # Errors
    ///
    /// Returns the ledger's error.
    pub async fn admit_upload_at(
        &self,
        payer: Address,
        size_bytes: u64,
        now: u64,
    ) -> Result<ConsumeDecision> {
        let decision = self
            .meter
            .consume_at(payer, bytes_to_mb(size_bytes), now)
            .await?;
        if decision.allowed {
            info!("Admitted {size_bytes} byte upload for {payer}");
        } else {
            info!(
                "Refused {size_bytes} byte upload for {payer} ({:.3}MB remaining)",
                decision.remaining_mb
            );
        }
        Ok(decision)
    }

    /// Release `size_bytes` after a deletion, returning the new usage in MB.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the payer has no subscription record.
    pub async fn release_upload(&self, payer: Address, size_bytes: u64) -> Result<f64> {
        self.meter
            .record_usage(payer, -bytes_to_mb(size_bytes))
            .await
    }

    /// Subscription status of `payer`.
    #[must_use]
    pub fn subscription_status(&self, payer: &Address) -> SubscriptionStatus {
        self.ledger.get_status(payer)
    }

    /// Tier catalog with availability as of `now`.
    #[must_use]
    pub fn tier_catalog_at(&self, now: u64) -> TierCatalogView {
        let allocated_mb = self
            .ledger
            .allocated_quota_mb(now)
            .saturating_add(*self.reserved_mb.lock());
        let mut warning = None;
        let tiers = self
            .ledger
            .catalog()
            .iter()
            .map(|tier| {
                let decision = self.gate.can_accept_new_subscription(
                    &tier.id,
                    allocated_mb,
                    self.config.global_capacity_mb,
                );
                let (available, reason) = match decision {
                    Ok(d) => {
                        if warning.is_none() {
                            warning = d.warning;
                        }
                        (d.allowed, d.reason)
                    }
                    Err(e) => (false, Some(e.to_string())),
                };
                TierAvailability {
                    tier: tier.clone(),
                    available,
                    reason,
                }
            })
            .collect();

        TierCatalogView {
            tiers,
            allocated_mb,
            capacity_mb: self.config.global_capacity_mb,
            warning,
        }
    }

    /// Verify and settle `payload`, advancing `trace` through
    /// `Verifying -> Verified -> Settling`, or to `Rejected`.
    async fn collect(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
        trace: &mut FlowTrace,
        now: u64,
    ) -> std::result::Result<Paid, Box<Rejection>> {
        trace.advance(ProtocolState::Verifying);
        let policy = PaymentPolicy {
            required_amount: requirements.max_amount_required,
            asset: requirements.asset,
            pay_to: requirements.pay_to,
            network: requirements.network.clone(),
            max_validity_secs: requirements.max_timeout_seconds,
        };
        let verification = self.verifier.verify_at(payload, &policy, now);
        if !verification.is_valid {
            trace.advance(ProtocolState::Rejected);
            let reason = verification
                .invalid_reason
                .unwrap_or(InvalidReason::BadSignature);
            info!(
                "Rejected payment for {} from {}: {reason}",
                requirements.resource,
                payload.payer()
            );
            return Err(Box::new(Rejection::new(
                RejectReason::Payment(reason),
                verification.payer,
                requirements.clone(),
            )));
        }
        let payer = verification.payer.unwrap_or_else(|| payload.payer());

        trace.advance(ProtocolState::Verified);
        trace.advance(ProtocolState::Settling);
        let settlement = self.settlement.settle_at(payload, requirements, now).await;

        if !settlement.success {
            let reason = settlement
                .error_reason
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            self.emit(GatewayEvent::SettlementFailed {
                payer,
                nonce: payload.nonce().to_string(),
                reason: reason.clone(),
            });
            if !self.config.fail_open {
                trace.advance(ProtocolState::Rejected);
                warn!(
                    "Settlement of {} for {payer} failed ({reason}), rejecting",
                    payload.nonce()
                );
                let mut rejection =
                    Rejection::new(RejectReason::SettlementFailed, Some(payer), requirements.clone());
                rejection.settlement_error = Some(reason);
                return Err(Box::new(rejection));
            }
            warn!(
                "Settlement of {} for {payer} failed ({reason}), granting anyway; needs out-of-band settlement",
                payload.nonce()
            );
        }

        if !self.claim_nonce(payload, now) {
            trace.advance(ProtocolState::Rejected);
            warn!("Nonce {} from {payer} already unlocked a resource", payload.nonce());
            return Err(Box::new(Rejection::new(
                RejectReason::NonceReused,
                Some(payer),
                requirements.clone(),
            )));
        }

        Ok(Paid {
            payer,
            amount: verification.amount,
            settlement,
        })
    }

    /// Mark the payload's nonce as having unlocked a resource. False if it
    /// already had.
    fn claim_nonce(&self, payload: &PaymentPayload, now: u64) -> bool {
        let valid_before = payload.payload.authorization.valid_before;
        let mut granted = self.granted_nonces.lock();
        let (_, seen) = granted.get_or_insert_with(payload.nonce(), valid_before, now, || ());
        !seen
    }

    fn finish<T>(mut trace: FlowTrace, resource: T, settlement: SettlementResult) -> Handled<T> {
        if settlement.success {
            trace.advance(ProtocolState::Granted);
            Handled {
                outcome: Outcome::Granted {
                    resource,
                    settlement: Some(settlement),
                },
                trace,
            }
        } else {
            trace.advance(ProtocolState::GrantedWithSettlementFailure);
            Handled {
                outcome: Outcome::GrantedWithSettlementFailure {
                    resource,
                    settlement,
                },
                trace,
            }
        }
    }

    fn emit(&self, event: GatewayEvent) {
        if let Some(ref events) = self.events {
            let _ = events.send(event);
        }
    }
}
