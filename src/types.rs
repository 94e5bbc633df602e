//! Core identifiers shared by every module.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Dynamically typed store content (strings, numbers, booleans, lists, dictionaries).
pub type Value = serde_json::Value;

/// Dictionary-shaped store content.
pub type Map = serde_json::Map<String, Value>;

/// BLAKE3 digest used for entry hashes and address derivation.
pub type Hash = [u8; 32];

/// Prefix every store address carries.
pub const ADDRESS_PREFIX: &str = "/meshstore/";

/// Opaque, content-derived identifier naming one store.
///
/// Format: `/meshstore/<64 lowercase hex characters>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parse and validate an address string.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        if is_valid_address(raw) {
            Ok(Address(raw.to_string()))
        } else {
            Err(StoreError::AddressInvalid(raw.to_string()))
        }
    }

    /// Build an address from a digest.
    pub fn from_hash(hash: &Hash) -> Self {
        Address(format!("{}{}", ADDRESS_PREFIX, hex::encode(hash)))
    }

    /// Return the address if `value` is a string that passes the validity predicate.
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_str().and_then(|s| Address::parse(s).ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::String(self.0.clone())
    }
}

/// Address validity predicate.
pub fn is_valid_address(raw: &str) -> bool {
    match raw.strip_prefix(ADDRESS_PREFIX) {
        Some(digest) => {
            digest.len() == 64
                && digest
                    .bytes()
                    .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        }
        None => false,
    }
}

/// True if `value` is a string holding a valid address.
pub fn is_address_value(value: &Value) -> bool {
    value.as_str().map(is_valid_address).unwrap_or(false)
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if is_valid_address(&value) {
            Ok(Address(value))
        } else {
            Err(StoreError::AddressInvalid(value))
        }
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
