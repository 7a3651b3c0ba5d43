//! Artifact metadata and store sources

use crate::rule_key::RuleKey;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Metadata bundle associated with a stored artifact.
///
/// An artifact may be stored under several rule keys at once. Immutable once
/// built; use [`ArtifactInfo::builder`] or [`ArtifactInfo::to_builder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    rule_keys: BTreeSet<RuleKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    build_target: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, String>,
}

impl ArtifactInfo {
    /// Start building an `ArtifactInfo`
    #[must_use]
    pub fn builder() -> ArtifactInfoBuilder {
        ArtifactInfoBuilder::default()
    }

    /// Shorthand for an artifact stored under a single key with no metadata
    #[must_use]
    pub fn for_key(key: RuleKey) -> Self {
        Self {
            rule_keys: BTreeSet::from([key]),
            build_target: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Keys the artifact is stored under
    #[must_use]
    pub fn rule_keys(&self) -> &BTreeSet<RuleKey> {
        &self.rule_keys
    }

    /// Build target provenance, if known
    #[must_use]
    pub fn build_target(&self) -> Option<&str> {
        self.build_target.as_deref()
    }

    /// Extra metadata stored alongside the artifact
    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Builder pre-populated with this info, for deriving a modified copy
    #[must_use]
    pub fn to_builder(&self) -> ArtifactInfoBuilder {
        ArtifactInfoBuilder {
            rule_keys: self.rule_keys.clone(),
            build_target: self.build_target.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Builder for [`ArtifactInfo`]
#[derive(Debug, Clone, Default)]
pub struct ArtifactInfoBuilder {
    rule_keys: BTreeSet<RuleKey>,
    build_target: Option<String>,
    metadata: BTreeMap<String, String>,
}

impl ArtifactInfoBuilder {
    /// Add a rule key
    #[must_use]
    pub fn rule_key(mut self, key: RuleKey) -> Self {
        self.rule_keys.insert(key);
        self
    }

    /// Add several rule keys
    #[must_use]
    pub fn rule_keys(mut self, keys: impl IntoIterator<Item = RuleKey>) -> Self {
        self.rule_keys.extend(keys);
        self
    }

    /// Replace all rule keys
    #[must_use]
    pub fn set_rule_keys(mut self, keys: impl IntoIterator<Item = RuleKey>) -> Self {
        self.rule_keys = keys.into_iter().collect();
        self
    }

    /// Set the build target
    #[must_use]
    pub fn build_target(mut self, target: impl Into<String>) -> Self {
        self.build_target = Some(target.into());
        self
    }

    /// Add a metadata entry
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Add several metadata entries
    #[must_use]
    pub fn metadata_entries(mut self, entries: impl IntoIterator<Item = (String, String)>) -> Self {
        self.metadata.extend(entries);
        self
    }

    /// Remove a metadata entry
    #[must_use]
    pub fn without_metadata(mut self, key: &str) -> Self {
        self.metadata.remove(key);
        self
    }

    /// Finish building.
    ///
    /// # Errors
    ///
    /// Returns error if no rule key was given
    pub fn build(self) -> Result<ArtifactInfo> {
        if self.rule_keys.is_empty() {
            return Err(Error::configuration(
                "ArtifactInfo requires at least one rule key",
            ));
        }
        Ok(ArtifactInfo {
            rule_keys: self.rule_keys,
            build_target: self.build_target,
            metadata: self.metadata,
        })
    }
}

/// Source file handed to a store.
///
/// A movable source belongs to the cache once the store begins: the cache may
/// rename it into place instead of copying. A non-movable source is only read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSource {
    path: PathBuf,
    movable: bool,
}

impl ArtifactSource {
    /// Source that the cache must copy and leave untouched
    #[must_use]
    pub fn copy_from(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            movable: false,
        }
    }

    /// Source that the cache may take ownership of
    #[must_use]
    pub fn move_from(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            movable: true,
        }
    }

    /// Path of the source file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the cache may rename the file away
    #[must_use]
    pub fn is_movable(&self) -> bool {
        self.movable
    }

    /// Same path, but the cache may no longer move it.
    ///
    /// Used when one source fans out to several caches.
    #[must_use]
    pub fn as_copy(&self) -> Self {
        Self::copy_from(self.path.clone())
    }
}
