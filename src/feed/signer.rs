//! ML-DSA-65 signing of time-bounded feed packets.
//!
//! A packet's signature covers the canonical JSON encoding of
//! `{feedName, value, schema, timestamp, validUntil}` with a fixed signing
//! context, so a signature over a feed packet cannot be replayed as anything
//! else signed by the same key.

use crate::error::{Error, Result};
use crate::payment::eip712::keccak256;
use crate::payment::unix_now;
use saorsa_pqc::api::sig::{
    ml_dsa_65, MlDsaPublicKey, MlDsaSecretKey, MlDsaSignature, MlDsaVariant,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Signing context for domain separation.
pub const SIGNING_CONTEXT: &[u8] = b"paygate-feed-packet-v1";

/// ML-DSA-65 signature size in bytes.
pub const SIGNATURE_SIZE: usize = 3309;

/// Derive the identifier of a feed from its name.
///
/// `0x`-prefixed hex of `keccak256(name)`, the same value a contract gets
/// from `keccak256(bytes(name))`.
#[must_use]
pub fn compute_feed_id(name: &str) -> String {
    format!("0x{}", hex::encode(keccak256(name.as_bytes())))
}

/// A signed, time-bounded feed value. Never persisted by this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPacket {
    /// Feed name.
    pub feed_name: String,
    /// Feed value.
    pub value: serde_json::Value,
    /// Schema identifier of `value`.
    pub schema: String,
    /// Unix seconds when the packet was signed.
    pub timestamp: u64,
    /// `timestamp + validitySecs`.
    pub valid_until: u64,
    /// Hex ML-DSA-65 signature over the canonical body.
    pub signature: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PacketBody<'a> {
    feed_name: &'a str,
    value: &'a serde_json::Value,
    schema: &'a str,
    timestamp: u64,
    valid_until: u64,
}

/// Canonical bytes covered by a packet signature.
///
/// Field order is fixed by the struct and `serde_json` object maps are
/// key-sorted, so equal content always encodes identically.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn canonical_bytes(
    feed_name: &str,
    value: &serde_json::Value,
    schema: &str,
    timestamp: u64,
    valid_until: u64,
) -> Result<Vec<u8>> {
    let body = PacketBody {
        feed_name,
        value,
        schema,
        timestamp,
        valid_until,
    };
    Ok(serde_json::to_vec(&body)?)
}

/// Signs feed packets with the node's ML-DSA-65 key.
pub struct FeedSigner {
    public_key: MlDsaPublicKey,
    secret_key: MlDsaSecretKey,
}

impl FeedSigner {
    /// Generate a fresh, process-lifetime keypair.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation fails.
    pub fn generate() -> Result<Self> {
        let (public_key, secret_key) = ml_dsa_65()
            .generate_keypair()
            .map_err(|e| Error::Crypto(format!("feed key generation failed: {e}")))?;
        Ok(Self {
            public_key,
            secret_key,
        })
    }

    /// Build a signer from raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if either key is malformed.
    pub fn from_bytes(public_key: &[u8], secret_key: &[u8]) -> Result<Self> {
        let public_key = MlDsaPublicKey::from_bytes(MlDsaVariant::MlDsa65, public_key)
            .map_err(|e| Error::Crypto(format!("invalid feed public key: {e}")))?;
        let secret_key = MlDsaSecretKey::from_bytes(MlDsaVariant::MlDsa65, secret_key)
            .map_err(|e| Error::Crypto(format!("invalid feed secret key: {e}")))?;
        Ok(Self {
            public_key,
            secret_key,
        })
    }

    /// Load a keypair written by `paygate-keygen`.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be read or parsed.
    pub fn from_files(secret_key_path: &Path, public_key_path: &Path) -> Result<Self> {
        debug!(
            "Loading feed signing key from {} / {}",
            secret_key_path.display(),
            public_key_path.display()
        );
        let secret_key = fs::read(secret_key_path)?;
        let public_key = fs::read(public_key_path)?;
        let signer = Self::from_bytes(&public_key, &secret_key)?;
        info!("Feed signing key loaded ({})", signer.public_key_fingerprint());
        Ok(signer)
    }

    /// The verifying key.
    #[must_use]
    pub fn public_key(&self) -> &MlDsaPublicKey {
        &self.public_key
    }

    /// Hex encoding of the verifying key.
    #[must_use]
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.to_bytes())
    }

    /// Short fingerprint of the verifying key for logs.
    #[must_use]
    pub fn public_key_fingerprint(&self) -> String {
        let digest = keccak256(&self.public_key.to_bytes());
        hex::encode(&digest[..8])
    }

    /// Sign a packet valid for `validity_secs` from now.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or signing fails.
    pub fn sign_packet(
        &self,
        feed_name: &str,
        value: serde_json::Value,
        schema: &str,
        validity_secs: u64,
    ) -> Result<SignedPacket> {
        self.sign_packet_at(feed_name, value, schema, validity_secs, unix_now())
    }

    /// Sign a packet as of unix time `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or signing fails.
    pub fn sign_packet_at(
        &self,
        feed_name: &str,
        value: serde_json::Value,
        schema: &str,
        validity_secs: u64,
        now: u64,
    ) -> Result<SignedPacket> {
        let valid_until = now.saturating_add(validity_secs);
        let body = canonical_bytes(feed_name, &value, schema, now, valid_until)?;

        let signature = ml_dsa_65()
            .sign_with_context(&self.secret_key, &body, SIGNING_CONTEXT)
            .map_err(|e| Error::Crypto(format!("packet signing failed: {e}")))?;

        debug!("Signed packet for feed {feed_name} valid until {valid_until}");

        Ok(SignedPacket {
            feed_name: feed_name.to_string(),
            value,
            schema: schema.to_string(),
            timestamp: now,
            valid_until,
            signature: hex::encode(signature.to_bytes()),
        })
    }
}

/// Check a packet's signature against `public_key`.
///
/// Freshness (`validUntil`) is the consumer's decision and is not checked.
///
/// # Errors
///
/// Returns `Error::Crypto` if the signature is malformed or does not match.
pub fn verify_packet(packet: &SignedPacket, public_key: &MlDsaPublicKey) -> Result<()> {
    let raw = hex::decode(&packet.signature)
        .map_err(|e| Error::Crypto(format!("packet signature is not hex: {e}")))?;

    if raw.len() != SIGNATURE_SIZE {
        return Err(Error::Crypto(format!(
            "invalid signature size: expected {SIGNATURE_SIZE}, got {}",
            raw.len()
        )));
    }

    let signature = MlDsaSignature::from_bytes(MlDsaVariant::MlDsa65, &raw)
        .map_err(|e| Error::Crypto(format!("invalid signature format: {e}")))?;

    let body = canonical_bytes(
        &packet.feed_name,
        &packet.value,
        &packet.schema,
        packet.timestamp,
        packet.valid_until,
    )?;

    let valid = ml_dsa_65()
        .verify_with_context(public_key, &body, &signature, SIGNING_CONTEXT)
        .map_err(|e| Error::Crypto(format!("signature verification error: {e}")))?;

    if valid {
        Ok(())
    } else {
        Err(Error::Crypto(
            "signature verification failed: invalid signature".to_string(),
        ))
    }
}
