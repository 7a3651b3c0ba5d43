//! Second-level content keys
//!
//! A two-level pointer stores one of these strings in its metadata:
//!
//! | form                     | blob location                                   |
//! |--------------------------|-------------------------------------------------|
//! | `cache/<sha256>:<size>`  | primary cache, under `RuleKey::for_content`      |
//! | `cas/<sha256>:<size>`    | content-addressed store                          |
//! | `<hex>`                  | primary cache, under that rule key (legacy)     |

use crate::cas::Digest;
use crate::rule_key::RuleKey;
use std::fmt;

/// Metadata key that marks a primary-cache entry as a two-level pointer.
pub const TWO_LEVEL_CONTENT_KEY: &str = "two-level-content-key";

/// Where a second-level blob lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKeyKind {
    /// Blob stored in the primary cache keyed by its content hash
    CacheOnly,
    /// Blob stored in the content-addressed store
    CasOnly,
    /// Pre-digest pointer naming a rule key in the primary cache
    OldStyle,
    /// Not a recognized form
    Unknown,
}

/// A parsed second-level content key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecondLevelContentKey {
    kind: ContentKeyKind,
    hash: String,
    size: u64,
    raw: String,
}

impl SecondLevelContentKey {
    /// Key for a blob stored in the primary cache
    #[must_use]
    pub fn cache(digest: &Digest) -> Self {
        Self::build(ContentKeyKind::CacheOnly, digest)
    }

    /// Key for a blob stored in the CAS
    #[must_use]
    pub fn cas(digest: &Digest) -> Self {
        Self::build(ContentKeyKind::CasOnly, digest)
    }

    fn build(kind: ContentKeyKind, digest: &Digest) -> Self {
        let prefix = if kind == ContentKeyKind::CasOnly { "cas" } else { "cache" };
        Self {
            kind,
            hash: digest.hash().to_string(),
            size: digest.size(),
            raw: format!("{prefix}/{}:{}", digest.hash(), digest.size()),
        }
    }

    /// Parse any string. Unrecognized input yields [`ContentKeyKind::Unknown`].
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let unknown = || Self {
            kind: ContentKeyKind::Unknown,
            hash: String::new(),
            size: 0,
            raw: raw.to_string(),
        };

        let (kind, rest) = if let Some(rest) = raw.strip_prefix("cache/") {
            (ContentKeyKind::CacheOnly, rest)
        } else if let Some(rest) = raw.strip_prefix("cas/") {
            (ContentKeyKind::CasOnly, rest)
        } else if RuleKey::from_hex(raw).is_ok() {
            return Self {
                kind: ContentKeyKind::OldStyle,
                hash: raw.to_ascii_lowercase(),
                size: 0,
                raw: raw.to_string(),
            };
        } else {
            return unknown();
        };

        let Some((hash, size)) = rest.split_once(':') else {
            return unknown();
        };
        let Ok(size) = size.parse::<u64>() else {
            return unknown();
        };
        match Digest::new(hash, size) {
            Ok(digest) => Self {
                kind,
                hash: digest.hash().to_string(),
                size,
                raw: raw.to_string(),
            },
            Err(_) => unknown(),
        }
    }

    /// Where the blob lives
    #[must_use]
    pub fn kind(&self) -> ContentKeyKind {
        self.kind
    }

    /// Hex content hash, or the legacy rule key
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Blob size; zero for legacy keys
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Digest of the blob, for the digest-carrying forms
    #[must_use]
    pub fn digest(&self) -> Option<Digest> {
        match self.kind {
            ContentKeyKind::CacheOnly | ContentKeyKind::CasOnly => {
                Digest::new(&self.hash, self.size).ok()
            }
            ContentKeyKind::OldStyle | ContentKeyKind::Unknown => None,
        }
    }

    /// Primary-cache rule key holding the blob, for the forms stored there
    #[must_use]
    pub fn primary_rule_key(&self) -> Option<RuleKey> {
        match self.kind {
            ContentKeyKind::CacheOnly | ContentKeyKind::OldStyle => {
                RuleKey::from_hex(&self.hash).ok()
            }
            ContentKeyKind::CasOnly | ContentKeyKind::Unknown => None,
        }
    }

    /// The string form stored in pointer metadata
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for SecondLevelContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
