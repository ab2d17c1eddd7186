//! Stateless payment verification.
//!
//! This is the core payment check for paygate-node: a pure function of the
//! submitted payload, the resource's price policy and the current time.

use crate::payment::address::Address;
use crate::payment::eip712::{authorization_digest, recover_signer, TokenDomain};
use crate::payment::types::{InvalidReason, PaymentPayload, VerificationResult, SCHEME_EXACT};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// What a payment must satisfy to unlock one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentPolicy {
    /// Price in atomic units.
    pub required_amount: u128,
    /// Settlement asset contract.
    pub asset: Address,
    /// Recipient of the payment.
    pub pay_to: Address,
    /// Expected network name.
    pub network: String,
    /// Furthest `validBefore` may lie beyond `now`, seconds.
    pub max_validity_secs: u64,
}

/// Configuration for the payment verifier.
#[derive(Debug, Clone)]
pub struct PaymentVerifierConfig {
    /// Chain id used in the EIP-712 domain.
    pub chain_id: u64,
    /// Token EIP-712 name.
    pub asset_name: String,
    /// Token EIP-712 version.
    pub asset_version: String,
}

impl Default for PaymentVerifierConfig {
    fn default() -> Self {
        Self {
            chain_id: 84532,
            asset_name: "USDC".to_string(),
            asset_version: "2".to_string(),
        }
    }
}

/// Verifies `exact` scheme payments without touching any state.
///
/// Safe to share across tasks and call concurrently.
#[derive(Debug, Clone)]
pub struct PaymentVerifier {
    config: PaymentVerifierConfig,
}

/// Current unix time in seconds.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl PaymentVerifier {
    /// Create a new payment verifier.
    #[must_use]
    pub fn new(config: PaymentVerifierConfig) -> Self {
        Self { config }
    }

    /// EIP-712 domain for payments in `asset`.
    #[must_use]
    pub fn domain_for(&self, asset: Address) -> TokenDomain {
        TokenDomain {
            name: self.config.asset_name.clone(),
            version: self.config.asset_version.clone(),
            chain_id: self.config.chain_id,
            verifying_contract: asset,
        }
    }

    /// Verify `payload` against `policy` at the current time.
    #[must_use]
    pub fn verify(&self, payload: &PaymentPayload, policy: &PaymentPolicy) -> VerificationResult {
        self.verify_at(payload, policy, unix_now())
    }

    /// Verify `payload` against `policy` as of unix time `now`.
    ///
    /// Checks run in a fixed order and stop at the first failure:
    /// scheme, network, recipient, amount, validity window, signature.
    #[must_use]
    pub fn verify_at(
        &self,
        payload: &PaymentPayload,
        policy: &PaymentPolicy,
        now: u64,
    ) -> VerificationResult {
        let auth = &payload.payload.authorization;
        let claimed = Some(auth.from);
        let reject = |reason: InvalidReason| {
            debug!(
                "Rejecting payment nonce={} from {}: {}",
                auth.nonce, auth.from, reason
            );
            VerificationResult::invalid(reason, claimed, auth.value)
        };

        if payload.scheme != SCHEME_EXACT {
            return reject(InvalidReason::SchemeMismatch);
        }
        if payload.network != policy.network {
            return reject(InvalidReason::NetworkMismatch);
        }
        if auth.to != policy.pay_to {
            return reject(InvalidReason::RecipientMismatch);
        }
        if auth.value < policy.required_amount {
            return reject(InvalidReason::InsufficientAmount);
        }
        if now < auth.valid_after {
            return reject(InvalidReason::NotYetValid);
        }
        if now > auth.valid_before {
            return reject(InvalidReason::Expired);
        }
        // Replay state is held until validBefore, so that horizon is capped.
        if auth.valid_before > now.saturating_add(policy.max_validity_secs) {
            return reject(InvalidReason::ValidityTooLong);
        }

        let digest = authorization_digest(auth, &self.domain_for(policy.asset));
        match recover_signer(&digest, &payload.payload.signature) {
            Ok(signer) if signer == auth.from => {
                debug!(
                    "Payment nonce={} verified: {} atomic units from {}",
                    auth.nonce, auth.value, signer
                );
                VerificationResult::valid(signer, auth.value)
            }
            Ok(signer) => {
                debug!("Signature recovered to {signer}, expected {}", auth.from);
                reject(InvalidReason::BadSignature)
            }
            Err(e) => {
                debug!("Signature recovery failed: {e}");
                reject(InvalidReason::BadSignature)
            }
        }
    }
}
