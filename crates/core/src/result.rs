//! Outcome value types for cache operations

use crate::rule_key::RuleKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Whether a backing cache accepts stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheReadMode {
    /// Fetch only; stores and deletes are ignored.
    #[serde(alias = "read_only")]
    ReadOnly,
    /// Fetches and stores.
    #[default]
    #[serde(alias = "read_write")]
    ReadWrite,
}

impl CacheReadMode {
    /// Whether stores and deletes should reach this cache
    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(self, Self::ReadWrite)
    }
}

/// Locality of a backing cache, used to build remote-only or local-only graphs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheType {
    /// Stored on this machine
    Local,
    /// Reached over the network
    Remote,
}

/// Kind of backing cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactCacheMode {
    /// Local directory
    Dir,
    /// Plain HTTP remote
    Http,
    /// HTTP remote with the batched endpoint protocol
    ThriftOverHttp,
    /// Local SQLite database
    Sqlite,
}

impl ArtifactCacheMode {
    /// Locality of this kind of cache
    #[must_use]
    pub fn cache_type(self) -> CacheType {
        match self {
            Self::Dir | Self::Sqlite => CacheType::Local,
            Self::Http | Self::ThriftOverHttp => CacheType::Remote,
        }
    }

    /// Config spelling of the mode
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dir => "dir",
            Self::Http => "http",
            Self::ThriftOverHttp => "thrift_over_http",
            Self::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for ArtifactCacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of fetch outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheResultType {
    /// Key not present
    Miss,
    /// Artifact materialized at the destination
    Hit,
    /// The fetch failed; see the error text
    Error,
    /// The fetch was not attempted
    Skipped,
    /// Existence confirmed, no payload transferred
    Contains,
    /// The local copy is already current
    LocalKeyUnchangedHit,
}

impl CacheResultType {
    /// Lower-case name used in logs and events
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Miss => "miss",
            Self::Hit => "hit",
            Self::Error => "error",
            Self::Skipped => "skipped",
            Self::Contains => "contains",
            Self::LocalKeyUnchangedHit => "local_key_unchanged_hit",
        }
    }

    /// Whether the outcome means the artifact is available
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Hit | Self::Contains | Self::LocalKeyUnchangedHit)
    }
}

impl fmt::Display for CacheResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a fetch or existence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheResult {
    kind: CacheResultType,
    cache_source: Option<String>,
    cache_mode: Option<ArtifactCacheMode>,
    error: Option<String>,
    metadata: BTreeMap<String, String>,
    artifact_size: Option<u64>,
    attempts: u32,
    two_level_content_key: Option<String>,
}

impl CacheResult {
    fn of(kind: CacheResultType) -> Self {
        Self {
            kind,
            cache_source: None,
            cache_mode: None,
            error: None,
            metadata: BTreeMap::new(),
            artifact_size: None,
            attempts: 1,
            two_level_content_key: None,
        }
    }

    /// Artifact found and materialized
    #[must_use]
    pub fn hit(
        cache_source: impl Into<String>,
        cache_mode: ArtifactCacheMode,
        metadata: BTreeMap<String, String>,
        artifact_size: u64,
    ) -> Self {
        Self {
            cache_source: Some(cache_source.into()),
            cache_mode: Some(cache_mode),
            metadata,
            artifact_size: Some(artifact_size),
            ..Self::of(CacheResultType::Hit)
        }
    }

    /// Key not present
    #[must_use]
    pub fn miss() -> Self {
        Self::of(CacheResultType::Miss)
    }

    /// Fetch failed
    #[must_use]
    pub fn error(
        cache_source: impl Into<String>,
        cache_mode: ArtifactCacheMode,
        error: impl Into<String>,
    ) -> Self {
        Self {
            cache_source: Some(cache_source.into()),
            cache_mode: Some(cache_mode),
            error: Some(error.into()),
            ..Self::of(CacheResultType::Error)
        }
    }

    /// Fetch not attempted
    #[must_use]
    pub fn skipped() -> Self {
        Self::of(CacheResultType::Skipped)
    }

    /// Key known to exist
    #[must_use]
    pub fn contains(cache_source: impl Into<String>, cache_mode: ArtifactCacheMode) -> Self {
        Self {
            cache_source: Some(cache_source.into()),
            cache_mode: Some(cache_mode),
            ..Self::of(CacheResultType::Contains)
        }
    }

    /// Local copy already current
    #[must_use]
    pub fn local_key_unchanged_hit() -> Self {
        Self::of(CacheResultType::LocalKeyUnchangedHit)
    }

    /// Outcome kind
    #[must_use]
    pub fn kind(&self) -> CacheResultType {
        self.kind
    }

    /// Name of the cache tier that produced the result
    #[must_use]
    pub fn cache_source(&self) -> Option<&str> {
        self.cache_source.as_deref()
    }

    /// Mode of the cache tier that produced the result
    #[must_use]
    pub fn cache_mode(&self) -> Option<ArtifactCacheMode> {
        self.cache_mode
    }

    /// Diagnostic text for errors
    #[must_use]
    pub fn cache_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Artifact metadata on hits
    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Fetched payload size on hits
    #[must_use]
    pub fn artifact_size(&self) -> Option<u64> {
        self.artifact_size
    }

    /// Number of fetch attempts made
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Content key when the hit was resolved through the second level
    #[must_use]
    pub fn two_level_content_key(&self) -> Option<&str> {
        self.two_level_content_key.as_deref()
    }

    /// Whether the artifact is available
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.kind.is_success()
    }

    /// Copy with the attempt count replaced
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Copy with the error text replaced
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Turn this result into an error, keeping its source and mode
    #[must_use]
    pub fn into_error(mut self, error: impl Into<String>) -> Self {
        self.kind = CacheResultType::Error;
        self.error = Some(error.into());
        self.artifact_size = None;
        self
    }

    /// Copy with metadata replaced
    #[must_use]
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Copy with payload size replaced
    #[must_use]
    pub fn with_artifact_size(mut self, size: u64) -> Self {
        self.artifact_size = Some(size);
        self
    }

    /// Copy annotated with the second-level content key
    #[must_use]
    pub fn with_two_level_content_key(mut self, key: impl Into<String>) -> Self {
        self.two_level_content_key = Some(key.into());
        self
    }
}

impl fmt::Display for CacheResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(source) = &self.cache_source {
            write!(f, " from {source}")?;
        }
        if let Some(error) = &self.error {
            write!(f, ": {error}")?;
        }
        Ok(())
    }
}

/// Outcome of a delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheDeleteResult {
    /// Caches the delete was issued to
    pub cache_names: Vec<String>,
    /// Keys confirmed deleted in at least one cache
    pub deleted: BTreeSet<RuleKey>,
}

impl CacheDeleteResult {
    /// Result for a single cache
    #[must_use]
    pub fn for_cache(name: impl Into<String>, deleted: BTreeSet<RuleKey>) -> Self {
        Self {
            cache_names: vec![name.into()],
            deleted,
        }
    }

    /// Fold another result into this one
    pub fn merge(&mut self, other: Self) {
        self.cache_names.extend(other.cache_names);
        self.deleted.extend(other.deleted);
    }
}
