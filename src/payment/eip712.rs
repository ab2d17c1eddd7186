//! EIP-712 hashing and secp256k1 recovery for EIP-3009 authorizations.
//!
//! The digest signed by a wallet is
//! `keccak256(0x1901 || domainSeparator || hashStruct(TransferWithAuthorization))`,
//! with the token contract as `verifyingContract`. Recovery yields the
//! signer's public key, whose Ethereum address must equal `authorization.from`.

use crate::error::{Error, Result};
use crate::payment::address::Address;
use crate::payment::types::Authorization;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};

const DOMAIN_TYPE: &[u8] =
    b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";

const TRANSFER_WITH_AUTHORIZATION_TYPE: &[u8] = b"TransferWithAuthorization(address from,address to,uint256 value,uint256 validAfter,uint256 validBefore,bytes32 nonce)";

/// EIP-712 domain of the settlement token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDomain {
    /// Token name as used in its domain separator (e.g. `USDC`).
    pub name: String,
    /// Token domain version (e.g. `2`).
    pub version: String,
    /// Chain id.
    pub chain_id: u64,
    /// Token contract address.
    pub verifying_contract: Address,
}

/// Keccak-256 of `data`.
#[must_use]
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

fn u256_word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

impl TokenDomain {
    /// The domain separator hash.
    #[must_use]
    pub fn separator(&self) -> [u8; 32] {
        let mut encoded = Vec::with_capacity(32 * 5);
        encoded.extend_from_slice(&keccak256(DOMAIN_TYPE));
        encoded.extend_from_slice(&keccak256(self.name.as_bytes()));
        encoded.extend_from_slice(&keccak256(self.version.as_bytes()));
        encoded.extend_from_slice(&u256_word(u128::from(self.chain_id)));
        encoded.extend_from_slice(&self.verifying_contract.to_word());
        keccak256(&encoded)
    }
}

/// `hashStruct` of a `TransferWithAuthorization` message.
#[must_use]
pub fn authorization_struct_hash(auth: &Authorization) -> [u8; 32] {
    let mut encoded = Vec::with_capacity(32 * 7);
    encoded.extend_from_slice(&keccak256(TRANSFER_WITH_AUTHORIZATION_TYPE));
    encoded.extend_from_slice(&auth.from.to_word());
    encoded.extend_from_slice(&auth.to.to_word());
    encoded.extend_from_slice(&u256_word(auth.value));
    encoded.extend_from_slice(&u256_word(u128::from(auth.valid_after)));
    encoded.extend_from_slice(&u256_word(u128::from(auth.valid_before)));
    encoded.extend_from_slice(&auth.nonce.0);
    keccak256(&encoded)
}

/// The final digest a wallet signs for `auth` under `domain`.
#[must_use]
pub fn authorization_digest(auth: &Authorization, domain: &TokenDomain) -> [u8; 32] {
    let mut encoded = Vec::with_capacity(2 + 64);
    encoded.extend_from_slice(&[0x19, 0x01]);
    encoded.extend_from_slice(&domain.separator());
    encoded.extend_from_slice(&authorization_struct_hash(auth));
    keccak256(&encoded)
}

/// Ethereum address of a secp256k1 public key.
#[must_use]
pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    // Skip the 0x04 SEC1 tag; the address is the low 20 bytes of the hash.
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&hash[12..]);
    Address::new(bytes)
}

/// Recover the signer address of a 65-byte `r||s||v` hex signature.
///
/// # Errors
///
/// Returns `Error::Crypto` if the signature is malformed or recovery fails.
pub fn recover_signer(digest: &[u8; 32], signature_hex: &str) -> Result<Address> {
    let raw = hex::decode(signature_hex.strip_prefix("0x").unwrap_or(signature_hex))
        .map_err(|e| Error::Crypto(format!("signature is not hex: {e}")))?;

    if raw.len() != 65 {
        return Err(Error::Crypto(format!(
            "invalid signature size: expected 65, got {}",
            raw.len()
        )));
    }

    let signature = Signature::from_slice(&raw[..64])
        .map_err(|e| Error::Crypto(format!("invalid signature format: {e}")))?;

    let v = raw[64];
    let recovery_byte = if v >= 27 { v - 27 } else { v };
    let recovery_id = RecoveryId::from_byte(recovery_byte)
        .ok_or_else(|| Error::Crypto(format!("invalid recovery id: {v}")))?;

    let key = VerifyingKey::recover_from_prehash(digest, &signature, recovery_id)
        .map_err(|e| Error::Crypto(format!("signature recovery failed: {e}")))?;

    Ok(address_of(&key))
}

/// Sign `auth` for `domain`, returning the `0x` hex `r||s||v` signature that
/// the verifier accepts. Used by client tooling and tests.
///
/// # Errors
///
/// Returns `Error::Crypto` if signing fails.
pub fn sign_authorization(
    key: &SigningKey,
    auth: &Authorization,
    domain: &TokenDomain,
) -> Result<String> {
    let digest = authorization_digest(auth, domain);
    let (signature, recovery_id) = key
        .sign_prehash_recoverable(&digest)
        .map_err(|e| Error::Crypto(format!("signing failed: {e}")))?;

    let mut raw = Vec::with_capacity(65);
    raw.extend_from_slice(&signature.to_bytes());
    raw.push(recovery_id.to_byte() + 27);
    Ok(format!("0x{}", hex::encode(raw)))
}
