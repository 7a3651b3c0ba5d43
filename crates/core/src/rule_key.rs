//! Rule keys: the content-derived lookup key for every cache operation

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Opaque, immutable content hash identifying a cached artifact.
///
/// Equality, ordering and hashing are byte-wise. The canonical string form is
/// lower-case hex, which is also the on-disk and on-wire encoding.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey(Arc<[u8]>);

impl RuleKey {
    /// Create a rule key from raw digest bytes.
    ///
    /// # Errors
    ///
    /// Returns error if `bytes` is empty
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(Error::invalid_key("RuleKey must not be empty"));
        }
        Ok(Self(bytes.into()))
    }

    /// Parse a rule key from its hex encoding.
    ///
    /// # Errors
    ///
    /// Returns error if the string is empty, has odd length or contains
    /// non-hex characters
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        if hex_str.is_empty() {
            return Err(Error::invalid_key("RuleKey must not be empty"));
        }
        let bytes = hex::decode(hex_str)
            .map_err(|e| Error::invalid_key(format!("RuleKey '{hex_str}' is not valid hex: {e}")))?;
        Ok(Self(bytes.into()))
    }

    /// Derive a rule key from arbitrary content with SHA-256.
    ///
    /// Used to address second-level blobs in the primary cache.
    #[must_use]
    pub fn for_content(data: &[u8]) -> Self {
        Self(Sha256::digest(data).to_vec().into())
    }

    /// Raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lower-case hex encoding
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RuleKey({})", self.to_hex())
    }
}

impl FromStr for RuleKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for RuleKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RuleKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
