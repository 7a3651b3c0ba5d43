//! Ordered fan-in fetch and fan-out store across several caches

use crate::cache::{ArtifactCache, SharedArtifactCache};
use crate::config::StoreFailurePolicy;
use crate::info::{ArtifactInfo, ArtifactSource};
use crate::result::{CacheDeleteResult, CacheReadMode, CacheResult, CacheResultType};
use crate::rule_key::RuleKey;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Combines an ordered list of caches.
///
/// Fetches try each cache in order and stop at the first hit; the hit is
/// then back-filled into the earlier writable caches that missed. Without a
/// hit the result is the first error, then a skip if any cache skipped, then
/// a miss. Stores and deletes fan out
/// concurrently to every writable cache.
pub struct MultiArtifactCache {
    caches: Vec<SharedArtifactCache>,
    policy: StoreFailurePolicy,
}

impl MultiArtifactCache {
    /// Combine `caches`, most preferred first
    #[must_use]
    pub fn new(caches: Vec<SharedArtifactCache>, policy: StoreFailurePolicy) -> Self {
        Self { caches, policy }
    }

    /// The combined caches, in order
    #[must_use]
    pub fn caches(&self) -> &[SharedArtifactCache] {
        &self.caches
    }

    fn writable(&self) -> Vec<&SharedArtifactCache> {
        self.caches
            .iter()
            .filter(|c| c.read_mode().is_writable())
            .collect()
    }

    /// Store a fetched hit into caches that missed it.
    async fn backfill(
        &self,
        targets: &[usize],
        target: Option<&str>,
        key: &RuleKey,
        output: &Path,
        hit: &CacheResult,
    ) {
        if targets.is_empty() {
            return;
        }
        let mut builder = ArtifactInfo::builder()
            .rule_key(key.clone())
            .metadata_entries(hit.metadata().clone());
        if let Some(target) = target {
            builder = builder.build_target(target);
        }
        let info = match builder.build() {
            Ok(info) => info,
            Err(e) => {
                warn!(rule_key = %key, error = %e, "Cannot back-fill artifact");
                return;
            }
        };
        let source = ArtifactSource::copy_from(output);
        let stores = targets.iter().map(|&index| {
            let cache = &self.caches[index];
            let info = &info;
            let source = &source;
            async move { (cache.name().to_string(), cache.store(info, source).await) }
        });
        for (name, outcome) in join_all(stores).await {
            match outcome {
                Ok(()) => debug!(cache = %name, rule_key = %key, "Back-filled artifact"),
                Err(e) => warn!(cache = %name, rule_key = %key, error = %e, "Back-fill failed"),
            }
        }
    }

    fn settle(&self, failures: Vec<String>) -> Result<()> {
        if failures.is_empty() {
            return Ok(());
        }
        match self.policy {
            StoreFailurePolicy::LogAndIgnore => Ok(()),
            StoreFailurePolicy::Propagate => Err(Error::StoreFailed { failures }),
        }
    }
}

/// Outcome when no tier hit: an error beats a skip, a skip beats a miss.
fn aggregate(error: Option<CacheResult>, skipped: bool) -> CacheResult {
    match error {
        Some(error) => error,
        None if skipped => CacheResult::skipped(),
        None => CacheResult::miss(),
    }
}

#[async_trait]
impl ArtifactCache for MultiArtifactCache {
    fn name(&self) -> &str {
        "multi"
    }

    async fn fetch(&self, target: Option<&str>, key: &RuleKey, output: &Path) -> CacheResult {
        let mut missed = Vec::new();
        let mut first_error: Option<CacheResult> = None;
        let mut skipped = false;
        for (index, cache) in self.caches.iter().enumerate() {
            let result = cache.fetch(target, key, output).await;
            if result.is_success() {
                self.backfill(&missed, target, key, output, &result).await;
                return result;
            }
            match result.kind() {
                CacheResultType::Error => {
                    first_error.get_or_insert(result);
                }
                CacheResultType::Skipped => skipped = true,
                CacheResultType::Miss if cache.read_mode().is_writable() => missed.push(index),
                _ => {}
            }
        }
        aggregate(first_error, skipped)
    }

    async fn fetch_many(
        &self,
        target: Option<&str>,
        requests: &[(RuleKey, PathBuf)],
    ) -> Vec<CacheResult> {
        let mut resolved: Vec<Option<CacheResult>> = vec![None; requests.len()];
        let mut errors: Vec<Option<CacheResult>> = vec![None; requests.len()];
        let mut missed: Vec<Vec<usize>> = vec![Vec::new(); requests.len()];
        let mut skipped = vec![false; requests.len()];
        let mut pending: Vec<usize> = (0..requests.len()).collect();

        for (index, cache) in self.caches.iter().enumerate() {
            if pending.is_empty() {
                break;
            }
            let batch: Vec<(RuleKey, PathBuf)> =
                pending.iter().map(|&i| requests[i].clone()).collect();
            let tier = cache.fetch_many(target, &batch).await;
            let mut still_pending = Vec::new();
            for (&i, result) in pending.iter().zip(tier) {
                let (key, output) = &requests[i];
                if result.is_success() {
                    self.backfill(&missed[i], target, key, output, &result)
                        .await;
                    resolved[i] = Some(result);
                    continue;
                }
                match result.kind() {
                    CacheResultType::Error => {
                        errors[i].get_or_insert(result);
                    }
                    CacheResultType::Skipped => skipped[i] = true,
                    CacheResultType::Miss if cache.read_mode().is_writable() => {
                        missed[i].push(index);
                    }
                    _ => {}
                }
                still_pending.push(i);
            }
            pending = still_pending;
        }

        resolved
            .into_iter()
            .zip(errors)
            .zip(skipped)
            .map(|((hit, error), skipped)| hit.unwrap_or_else(|| aggregate(error, skipped)))
            .collect()
    }

    async fn contains_many(&self, keys: &[RuleKey]) -> HashMap<RuleKey, CacheResult> {
        let mut results: HashMap<RuleKey, CacheResult> = HashMap::new();
        let mut pending: Vec<RuleKey> = keys.to_vec();
        for cache in &self.caches {
            if pending.is_empty() {
                break;
            }
            let tier = cache.contains_many(&pending).await;
            pending.retain(|key| {
                let Some(result) = tier.get(key) else {
                    return true;
                };
                if result.is_success() {
                    results.insert(key.clone(), result.clone());
                    return false;
                }
                let rank = |r: &CacheResult| match r.kind() {
                    CacheResultType::Error => 2,
                    CacheResultType::Miss => 1,
                    _ => 0,
                };
                let replace = results
                    .get(key)
                    .is_none_or(|current| rank(result) > rank(current));
                if replace {
                    results.insert(key.clone(), result.clone());
                }
                true
            });
        }
        for key in keys {
            results
                .entry(key.clone())
                .or_insert_with(CacheResult::skipped);
        }
        results
    }

    async fn store(&self, info: &ArtifactInfo, source: &ArtifactSource) -> Result<()> {
        let writable = self.writable();
        // A movable source can only be handed to one cache
        let shared = if writable.len() > 1 {
            source.as_copy()
        } else {
            source.clone()
        };
        let stores = writable.iter().map(|cache| {
            let shared = &shared;
            async move { (cache.name().to_string(), cache.store(info, shared).await) }
        });
        let mut failures = Vec::new();
        for (name, outcome) in join_all(stores).await {
            if let Err(e) = outcome {
                warn!(cache = %name, error = %e, "Store failed");
                failures.push(format!("{name}: {e}"));
            }
        }
        self.settle(failures)
    }

    async fn store_many(&self, artifacts: Vec<(ArtifactInfo, ArtifactSource)>) -> Result<()> {
        let writable = self.writable();
        let single = writable.len() == 1;
        let stores = writable.iter().map(|cache| {
            let batch: Vec<(ArtifactInfo, ArtifactSource)> = artifacts
                .iter()
                .map(|(info, source)| {
                    let source = if single { source.clone() } else { source.as_copy() };
                    (info.clone(), source)
                })
                .collect();
            async move { (cache.name().to_string(), cache.store_many(batch).await) }
        });
        let mut failures = Vec::new();
        for (name, outcome) in join_all(stores).await {
            if let Err(e) = outcome {
                warn!(cache = %name, error = %e, "Batch store failed");
                failures.push(format!("{name}: {e}"));
            }
        }
        self.settle(failures)
    }

    async fn delete(&self, keys: &[RuleKey]) -> Result<CacheDeleteResult> {
        let deletes = self
            .writable()
            .into_iter()
            .map(|cache| async move { (cache.name().to_string(), cache.delete(keys).await) });
        let mut merged = CacheDeleteResult::default();
        let mut failures = Vec::new();
        for (name, outcome) in join_all(deletes).await {
            match outcome {
                Ok(result) => merged.merge(result),
                Err(e) => {
                    warn!(cache = %name, error = %e, "Delete failed");
                    failures.push(format!("{name}: {e}"));
                }
            }
        }
        self.settle(failures)?;
        Ok(merged)
    }

    fn read_mode(&self) -> CacheReadMode {
        if self.caches.iter().any(|c| c.read_mode().is_writable()) {
            CacheReadMode::ReadWrite
        } else {
            CacheReadMode::ReadOnly
        }
    }

    fn skip_pending_and_future_fetches(&self) {
        for cache in &self.caches {
            cache.skip_pending_and_future_fetches();
        }
    }

    async fn close(&self) -> Result<()> {
        let mut first_error = None;
        for cache in &self.caches {
            if let Err(e) = cache.close().await {
                warn!(cache = %cache.name(), error = %e, "Failed to close cache");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
