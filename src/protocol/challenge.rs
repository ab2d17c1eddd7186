//! Payment-required challenges and rejections in the x402 JSON shape.

use crate::feed::SignedPacket;
use crate::payment::{
    Address, AssetExtra, InvalidReason, PaymentRequired, PaymentRequirements, SCHEME_EXACT,
    X402_VERSION,
};
use serde::Serialize;
use std::fmt;

/// Where and how this gateway gets paid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentTerms {
    /// Network name (e.g. `base-sepolia`).
    pub network: String,
    /// Recipient.
    pub pay_to: Address,
    /// Asset contract.
    pub asset: Address,
    /// Asset EIP-712 name.
    pub asset_name: String,
    /// Asset EIP-712 version.
    pub asset_version: String,
    /// Time the payer has to complete payment.
    pub max_timeout_seconds: u64,
}

impl PaymentTerms {
    /// Requirements for paying `amount` for `resource`.
    #[must_use]
    pub fn requirements(
        &self,
        amount: u128,
        resource: &str,
        description: String,
        mime_type: &str,
    ) -> PaymentRequirements {
        PaymentRequirements {
            scheme: SCHEME_EXACT.to_string(),
            network: self.network.clone(),
            max_amount_required: amount,
            resource: resource.to_string(),
            description,
            mime_type: mime_type.to_string(),
            pay_to: self.pay_to,
            max_timeout_seconds: self.max_timeout_seconds,
            asset: self.asset,
            extra: Some(AssetExtra {
                name: self.asset_name.clone(),
                version: self.asset_version.clone(),
            }),
        }
    }
}

/// A "payment required" response body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    /// Always false.
    pub success: bool,
    /// Always `Payment required`.
    pub error: String,
    /// Always true.
    pub payment_required: bool,
    /// Accepted payment options.
    pub x402: PaymentRequired,
    /// Pre-signed packet for feed resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet: Option<SignedPacket>,
    /// Capacity notice for subscription resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl Challenge {
    /// A challenge for one set of requirements.
    #[must_use]
    pub fn new(requirements: PaymentRequirements) -> Self {
        Self {
            success: false,
            error: "Payment required".to_string(),
            payment_required: true,
            x402: PaymentRequired {
                x402_version: X402_VERSION,
                accepts: vec![requirements],
            },
            packet: None,
            warning: None,
        }
    }

    /// Attach a pre-signed packet.
    #[must_use]
    pub fn with_packet(mut self, packet: SignedPacket) -> Self {
        self.packet = Some(packet);
        self
    }

    /// Attach a capacity warning.
    #[must_use]
    pub fn with_warning(mut self, warning: Option<String>) -> Self {
        self.warning = warning;
        self
    }

    /// The single requirement set of this challenge.
    #[must_use]
    pub fn requirements(&self) -> Option<&PaymentRequirements> {
        self.x402.accepts.first()
    }
}

/// Why a submitted payment did not unlock the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The verifier refused the payment.
    Payment(InvalidReason),
    /// Strict mode: the payment was valid but could not be settled.
    SettlementFailed,
    /// The nonce already unlocked a resource.
    NonceReused,
}

impl RejectReason {
    /// Wire name sent as `invalidReason`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Payment(reason) => reason.as_str(),
            Self::SettlementFailed => "settlement_failed",
            Self::NonceReused => "nonce_already_used",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RejectReason {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A 402-class refusal carrying the reason verbatim.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    /// Always false.
    pub success: bool,
    /// Human readable summary.
    pub error: String,
    /// Machine readable reason.
    pub invalid_reason: RejectReason,
    /// Payer as claimed or recovered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<Address>,
    /// Settlement error when `invalidReason` is `settlement_failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_error: Option<String>,
    /// What a corrected payment must satisfy.
    pub x402: PaymentRequired,
}

impl Rejection {
    /// Refuse with `reason`, restating `requirements`.
    #[must_use]
    pub fn new(
        reason: RejectReason,
        payer: Option<Address>,
        requirements: PaymentRequirements,
    ) -> Self {
        let error = match reason {
            RejectReason::Payment(_) => "Payment invalid",
            RejectReason::SettlementFailed => "Settlement failed",
            RejectReason::NonceReused => "Payment already used",
        };
        Self {
            success: false,
            error: error.to_string(),
            invalid_reason: reason,
            payer,
            settlement_error: None,
            x402: PaymentRequired {
                x402_version: X402_VERSION,
                accepts: vec![requirements],
            },
        }
    }
}
