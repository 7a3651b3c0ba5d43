//! The capability contract shared by every backing store and decorator

use crate::info::{ArtifactInfo, ArtifactSource};
use crate::result::{CacheDeleteResult, CacheReadMode, CacheResult};
use crate::rule_key::RuleKey;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Shared handle to a cache in a decorator chain
pub type SharedArtifactCache = Arc<dyn ArtifactCache>;

/// An artifact cache.
///
/// Fetch outcomes, including misses and transport failures, are reported as
/// [`CacheResult`] values. Only stores, deletes and teardown return `Err`.
#[async_trait]
pub trait ArtifactCache: Send + Sync {
    /// Name used in logs, events and `CacheResult::cache_source`
    fn name(&self) -> &str;

    /// Fetch the artifact stored under `key` into `output`.
    ///
    /// On a hit the destination is fully written before the result is
    /// returned. On any other outcome the destination is left absent or
    /// untouched.
    async fn fetch(&self, target: Option<&str>, key: &RuleKey, output: &Path) -> CacheResult;

    /// Fetch several artifacts. Results are in request order.
    async fn fetch_many(
        &self,
        target: Option<&str>,
        requests: &[(RuleKey, PathBuf)],
    ) -> Vec<CacheResult> {
        let mut results = Vec::with_capacity(requests.len());
        for (key, output) in requests {
            results.push(self.fetch(target, key, output).await);
        }
        results
    }

    /// Check which keys exist without transferring payloads.
    ///
    /// Caches without a cheap existence check report `Skipped`.
    async fn contains_many(&self, keys: &[RuleKey]) -> HashMap<RuleKey, CacheResult> {
        keys.iter()
            .map(|key| (key.clone(), CacheResult::skipped()))
            .collect()
    }

    /// Store an artifact under every rule key in `info`.
    ///
    /// # Errors
    ///
    /// Returns error if the artifact could not be persisted
    async fn store(&self, info: &ArtifactInfo, source: &ArtifactSource) -> Result<()>;

    /// Store several artifacts.
    ///
    /// Equivalent to issuing every store independently. All stores run to
    /// completion; the first error is returned afterwards.
    ///
    /// # Errors
    ///
    /// Returns the first store error
    async fn store_many(&self, artifacts: Vec<(ArtifactInfo, ArtifactSource)>) -> Result<()> {
        let results = futures::future::join_all(
            artifacts
                .iter()
                .map(|(info, source)| self.store(info, source)),
        )
        .await;
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    /// Delete keys, best effort.
    ///
    /// # Errors
    ///
    /// Returns error if the cache could not be reached at all
    async fn delete(&self, keys: &[RuleKey]) -> Result<CacheDeleteResult>;

    /// Whether this cache accepts stores
    fn read_mode(&self) -> CacheReadMode;

    /// Make in-flight and future fetches resolve to `Skipped` promptly.
    fn skip_pending_and_future_fetches(&self);

    /// Release resources. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns error if background work could not be drained
    async fn close(&self) -> Result<()>;
}
