//! EVM address handling for payers, recipients and asset contracts.
//!
//! Addresses are kept as raw 20-byte values and rendered as lowercase
//! `0x`-prefixed hex, so comparisons are independent of EIP-55 casing.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A 20-byte EVM account or contract address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; 20]);

impl Address {
    /// Wrap raw address bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Raw address bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Left-pad the address to a 32-byte ABI word.
    #[must_use]
    pub fn to_word(&self) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(&self.0);
        word
    }
}

/// Parse an EVM address string.
///
/// # Errors
///
/// Returns `Error::Validation` if the string is not `0x` followed by 40 hex
/// characters.
pub fn parse_address(address: &str) -> Result<Address> {
    if !address.starts_with("0x") && !address.starts_with("0X") {
        return Err(Error::Validation(format!(
            "invalid address format: must start with '0x', got: {address}"
        )));
    }

    if address.len() != 42 {
        return Err(Error::Validation(format!(
            "invalid address length: expected 42 characters, got {}",
            address.len()
        )));
    }

    let hex_part = &address[2..];
    if !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::Validation(format!(
            "invalid address: contains non-hex characters: {address}"
        )));
    }

    let bytes = hex::decode(hex_part)
        .map_err(|_| Error::Validation("invalid address: not hex".to_string()))?;

    let mut address_bytes = [0u8; 20];
    address_bytes.copy_from_slice(&bytes);
    Ok(Address(address_bytes))
}

/// Validate that an EVM address is properly formatted.
#[must_use]
pub fn is_valid_address(address: &str) -> bool {
    parse_address(address).is_ok()
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_address(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_address(&s).map_err(serde::de::Error::custom)
    }
}
