//! Wire types for the x402 `exact` scheme.
//!
//! Field names follow the x402 v1 JSON encoding (camelCase, atomic amounts
//! and timestamps as decimal strings), so payloads produced by standard x402
//! wallets deserialize unchanged.

use crate::error::{Error, Result};
use crate::payment::address::Address;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// The only payment scheme this node accepts.
pub const SCHEME_EXACT: &str = "exact";

/// x402 protocol version spoken by this node.
pub const X402_VERSION: u8 = 1;

/// Single-use 32-byte authorization nonce.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Nonce(pub [u8; 32]);

impl Nonce {
    /// Parse a `0x`-prefixed 32-byte hex nonce.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the string is not 64 hex characters.
    pub fn parse(s: &str) -> Result<Self> {
        let hex_part = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(hex_part)
            .map_err(|_| Error::Validation("invalid nonce: not hex".to_string()))?;
        let array: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            Error::Validation(format!("invalid nonce length: expected 32 bytes, got {}", v.len()))
        })?;
        Ok(Self(array))
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({self})")
    }
}

impl Serialize for Nonce {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Nonce {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Decimal-string encoding for integers, accepting bare JSON numbers on input.
pub(crate) mod decimal {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::fmt::Display;
    use std::str::FromStr;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(u64),
    }

    pub fn serialize<T: Display, S: Serializer>(value: &T, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(value)
    }

    pub fn deserialize<'de, T, D>(d: D) -> Result<T, D::Error>
    where
        T: FromStr + From<u64>,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        match StringOrNumber::deserialize(d)? {
            StringOrNumber::String(s) => s.trim().parse().map_err(de::Error::custom),
            StringOrNumber::Number(n) => Ok(T::from(n)),
        }
    }
}

/// EIP-3009 `TransferWithAuthorization` parameters signed by the payer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    /// Payer address.
    pub from: Address,
    /// Recipient address.
    pub to: Address,
    /// Amount in atomic units of the asset.
    #[serde(with = "decimal")]
    pub value: u128,
    /// Unix seconds before which the authorization is not valid.
    #[serde(with = "decimal")]
    pub valid_after: u64,
    /// Unix seconds after which the authorization has expired.
    #[serde(with = "decimal")]
    pub valid_before: u64,
    /// Single-use nonce.
    pub nonce: Nonce,
}

/// Scheme-specific payload for `exact`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExactPayload {
    /// 65-byte `r||s||v` secp256k1 signature, hex encoded.
    pub signature: String,
    /// The signed authorization.
    pub authorization: Authorization,
}

/// A payment submitted by a payer's wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    /// Protocol version.
    #[serde(default = "default_version")]
    pub x402_version: u8,
    /// Payment scheme, must be `exact`.
    pub scheme: String,
    /// Network (chain) name.
    pub network: String,
    /// Scheme payload.
    pub payload: ExactPayload,
}

const fn default_version() -> u8 {
    X402_VERSION
}

impl PaymentPayload {
    /// The authorization's single-use nonce.
    #[must_use]
    pub fn nonce(&self) -> Nonce {
        self.payload.authorization.nonce
    }

    /// Claimed payer address.
    #[must_use]
    pub fn payer(&self) -> Address {
        self.payload.authorization.from
    }
}

/// Why the verifier rejected a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    /// Scheme was not `exact`.
    SchemeMismatch,
    /// Network did not match the node's network.
    NetworkMismatch,
    /// Authorization pays someone else.
    RecipientMismatch,
    /// Authorization value is below the price.
    InsufficientAmount,
    /// `now > validBefore`.
    Expired,
    /// `now < validAfter`.
    NotYetValid,
    /// `validBefore` lies further ahead than the requirements' timeout.
    ValidityTooLong,
    /// Signature malformed or recovers to a different address.
    BadSignature,
}

impl InvalidReason {
    /// The wire name of this reason.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SchemeMismatch => "scheme_mismatch",
            Self::NetworkMismatch => "network_mismatch",
            Self::RecipientMismatch => "recipient_mismatch",
            Self::InsufficientAmount => "insufficient_amount",
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::ValidityTooLong => "validity_too_long",
            Self::BadSignature => "bad_signature",
        }
    }
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of payment verification. Pure function of payload and policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    /// Whether the payment satisfies the policy.
    pub is_valid: bool,
    /// Recovered (or, on early rejection, claimed) payer.
    pub payer: Option<Address>,
    /// Authorized amount in atomic units.
    #[serde(with = "decimal")]
    pub amount: u128,
    /// Rejection reason when `is_valid` is false.
    pub invalid_reason: Option<InvalidReason>,
}

impl VerificationResult {
    /// A successful verification.
    #[must_use]
    pub const fn valid(payer: Address, amount: u128) -> Self {
        Self {
            is_valid: true,
            payer: Some(payer),
            amount,
            invalid_reason: None,
        }
    }

    /// A rejected verification.
    #[must_use]
    pub const fn invalid(reason: InvalidReason, payer: Option<Address>, amount: u128) -> Self {
        Self {
            is_valid: false,
            payer,
            amount,
            invalid_reason: Some(reason),
        }
    }
}

/// Outcome of settling a payment. Single-valued per nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementResult {
    /// Whether the payment was finalized.
    pub success: bool,
    /// Transaction hash or facilitator reference.
    pub transaction_ref: Option<String>,
    /// Network the settlement ran on.
    pub network: String,
    /// Failure reason when `success` is false.
    pub error_reason: Option<String>,
}

impl SettlementResult {
    /// A failed settlement on `network`.
    #[must_use]
    pub fn failed(network: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            transaction_ref: None,
            network: network.into(),
            error_reason: Some(reason.into()),
        }
    }
}

/// Extra EIP-712 domain hints advertised to wallets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetExtra {
    /// Token EIP-712 name.
    pub name: String,
    /// Token EIP-712 version.
    pub version: String,
}

/// One accepted way to pay for a resource (an entry of `accepts`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    /// Payment scheme.
    pub scheme: String,
    /// Network name.
    pub network: String,
    /// Price in atomic units.
    #[serde(with = "decimal")]
    pub max_amount_required: u128,
    /// Resource path being paid for.
    pub resource: String,
    /// Human readable description.
    pub description: String,
    /// MIME type of the resource.
    pub mime_type: String,
    /// Recipient.
    pub pay_to: Address,
    /// How long the payer has to complete payment.
    pub max_timeout_seconds: u64,
    /// Asset contract.
    pub asset: Address,
    /// EIP-712 domain hints.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub extra: Option<AssetExtra>,
}

/// The `x402` section of a challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    /// Protocol version.
    pub x402_version: u8,
    /// Accepted payment options.
    pub accepts: Vec<PaymentRequirements>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    const PAYLOAD_JSON: &str = r#"{
        "x402Version": 1,
        "scheme": "exact",
        "network": "base-sepolia",
        "payload": {
            "signature": "0x00",
            "authorization": {
                "from": "0x857b06519E91e3A54538791bDbb0E22373e36b66",
                "to": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
                "value": "5000000",
                "validAfter": "1740672089",
                "validBefore": 1740672154,
                "nonce": "0xf3746613c2d920b5fdabc0856f2aeb2d4f88ee6037b8cc5d04a71a4462f13480"
            }
        }
    }"#;

    #[test]
    fn test_payload_accepts_strings_and_numbers() {
        let payload: PaymentPayload = serde_json::from_str(PAYLOAD_JSON).expect("parse");
        assert_eq!(payload.scheme, SCHEME_EXACT);
        assert_eq!(payload.payload.authorization.value, 5_000_000);
        assert_eq!(payload.payload.authorization.valid_after, 1_740_672_089);
        assert_eq!(payload.payload.authorization.valid_before, 1_740_672_154);
    }

    #[test]
    fn test_amounts_serialize_as_strings() {
        let payload: PaymentPayload = serde_json::from_str(PAYLOAD_JSON).expect("parse");
        let value = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(value["payload"]["authorization"]["value"], "5000000");
        assert_eq!(value["payload"]["authorization"]["validBefore"], "1740672154");
    }

    #[test]
    fn test_nonce_rejects_wrong_length() {
        assert!(Nonce::parse("0x1234").is_err());
        assert!(Nonce::parse(&format!("0x{}", "ab".repeat(32))).is_ok());
    }

    #[test]
    fn test_invalid_reason_wire_names() {
        let json = serde_json::to_string(&InvalidReason::NotYetValid).expect("serialize");
        assert_eq!(json, "\"not_yet_valid\"");
        assert_eq!(InvalidReason::InsufficientAmount.to_string(), "insufficient_amount");
    }
}
