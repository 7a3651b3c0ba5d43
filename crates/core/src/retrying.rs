//! Bounded fetch retries

use crate::cache::{ArtifactCache, SharedArtifactCache};
use crate::info::{ArtifactInfo, ArtifactSource};
use crate::result::{CacheDeleteResult, CacheReadMode, CacheResult, CacheResultType};
use crate::rule_key::RuleKey;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Retries failed fetches against the same delegate and destination.
///
/// Attempts are strictly sequential. A non-error result ends the loop; after
/// `max_fetch_retries` errors the diagnostics of every attempt are returned in
/// one `Error` result. Stores and deletes pass through.
pub struct RetryingCacheDecorator {
    delegate: SharedArtifactCache,
    max_fetch_retries: u32,
    skipped: AtomicBool,
}

impl RetryingCacheDecorator {
    /// Wrap `delegate`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `max_fetch_retries` is zero
    pub fn new(delegate: SharedArtifactCache, max_fetch_retries: u32) -> Result<Self> {
        if max_fetch_retries == 0 {
            return Err(Error::configuration(
                "max_fetch_retries must be greater than zero",
            ));
        }
        Ok(Self {
            delegate,
            max_fetch_retries,
            skipped: AtomicBool::new(false),
        })
    }

    /// Continue the attempt loop at `attempt`, carrying earlier diagnostics.
    async fn attempt_from(
        &self,
        target: Option<&str>,
        key: &RuleKey,
        output: &Path,
        mut attempt: u32,
        mut errors: Vec<String>,
        mut last: Option<CacheResult>,
    ) -> CacheResult {
        while attempt <= self.max_fetch_retries {
            if self.skipped.load(Ordering::Acquire) {
                return CacheResult::skipped();
            }
            let result = self.delegate.fetch(target, key, output).await;
            if result.kind() != CacheResultType::Error {
                return result.with_attempts(attempt);
            }
            let message = result.cache_error().unwrap_or("unknown error").to_string();
            if attempt < self.max_fetch_retries {
                info!(
                    cache = %self.delegate.name(),
                    rule_key = %key,
                    attempt,
                    error = %message,
                    "Fetch failed, retrying"
                );
            }
            errors.push(message);
            last = Some(result);
            attempt += 1;
        }

        let joined = errors.join("\n");
        warn!(
            cache = %self.delegate.name(),
            rule_key = %key,
            attempts = self.max_fetch_retries,
            "Failed to fetch after {} attempts",
            self.max_fetch_retries
        );
        last.unwrap_or_else(CacheResult::miss)
            .with_error(joined)
            .with_attempts(self.max_fetch_retries)
    }
}

#[async_trait]
impl ArtifactCache for RetryingCacheDecorator {
    fn name(&self) -> &str {
        self.delegate.name()
    }

    async fn fetch(&self, target: Option<&str>, key: &RuleKey, output: &Path) -> CacheResult {
        self.attempt_from(target, key, output, 1, Vec::new(), None)
            .await
    }

    async fn fetch_many(
        &self,
        target: Option<&str>,
        requests: &[(RuleKey, PathBuf)],
    ) -> Vec<CacheResult> {
        if self.skipped.load(Ordering::Acquire) {
            return requests.iter().map(|_| CacheResult::skipped()).collect();
        }
        let first = self.delegate.fetch_many(target, requests).await;
        let mut results = Vec::with_capacity(requests.len());
        for ((key, output), result) in requests.iter().zip(first) {
            if result.kind() == CacheResultType::Error {
                let errors = vec![result.cache_error().unwrap_or("unknown error").to_string()];
                results.push(
                    self.attempt_from(target, key, output, 2, errors, Some(result))
                        .await,
                );
            } else {
                results.push(result);
            }
        }
        results
    }

    async fn contains_many(&self, keys: &[RuleKey]) -> HashMap<RuleKey, CacheResult> {
        self.delegate.contains_many(keys).await
    }

    async fn store(&self, info: &ArtifactInfo, source: &ArtifactSource) -> Result<()> {
        self.delegate.store(info, source).await
    }

    async fn store_many(&self, artifacts: Vec<(ArtifactInfo, ArtifactSource)>) -> Result<()> {
        self.delegate.store_many(artifacts).await
    }

    async fn delete(&self, keys: &[RuleKey]) -> Result<CacheDeleteResult> {
        self.delegate.delete(keys).await
    }

    fn read_mode(&self) -> CacheReadMode {
        self.delegate.read_mode()
    }

    fn skip_pending_and_future_fetches(&self) {
        self.skipped.store(true, Ordering::Release);
        self.delegate.skip_pending_and_future_fetches();
    }

    async fn close(&self) -> Result<()> {
        self.delegate.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::ArtifactCacheMode;
    use crate::test_utils::ScriptedCache;
    use std::sync::Arc;

    fn key() -> RuleKey {
        RuleKey::from_hex("deadbeef").unwrap()
    }

    fn error(msg: &str) -> CacheResult {
        CacheResult::error("scripted", ArtifactCacheMode::Http, msg)
    }

    #[test]
    fn test_zero_retries_rejected() {
        let delegate = Arc::new(ScriptedCache::new("scripted"));
        assert!(RetryingCacheDecorator::new(delegate, 0).is_err());
    }

    #[tokio::test]
    async fn test_succeeds_after_k_errors() {
        let delegate = Arc::new(ScriptedCache::new("scripted").with_fetch_results(vec![
            error("one"),
            error("two"),
            CacheResult::hit("scripted", ArtifactCacheMode::Http, Default::default(), 3),
        ]));
        let cache = RetryingCacheDecorator::new(delegate.clone(), 3).unwrap();
        let result = cache.fetch(None, &key(), Path::new("/tmp/unused")).await;
        assert_eq!(result.kind(), CacheResultType::Hit);
        assert_eq!(result.attempts(), 3);
        assert_eq!(delegate.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_joins_diagnostics() {
        let delegate = Arc::new(ScriptedCache::new("scripted").with_fetch_results(vec![
            error("one"),
            error("two"),
            CacheResult::hit("scripted", ArtifactCacheMode::Http, Default::default(), 3),
        ]));
        let cache = RetryingCacheDecorator::new(delegate.clone(), 2).unwrap();
        let result = cache.fetch(None, &key(), Path::new("/tmp/unused")).await;
        assert_eq!(result.kind(), CacheResultType::Error);
        assert_eq!(result.attempts(), 2);
        assert_eq!(result.cache_error(), Some("one\ntwo"));
        assert_eq!(delegate.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_miss_is_not_retried() {
        let delegate = Arc::new(
            ScriptedCache::new("scripted").with_fetch_results(vec![CacheResult::miss()]),
        );
        let cache = RetryingCacheDecorator::new(delegate.clone(), 5).unwrap();
        let result = cache.fetch(None, &key(), Path::new("/tmp/unused")).await;
        assert_eq!(result.kind(), CacheResultType::Miss);
        assert_eq!(result.attempts(), 1);
        assert_eq!(delegate.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_skip_stops_further_attempts() {
        let delegate = Arc::new(ScriptedCache::new("scripted"));
        let cache = RetryingCacheDecorator::new(delegate.clone(), 3).unwrap();
        cache.skip_pending_and_future_fetches();
        let result = cache.fetch(None, &key(), Path::new("/tmp/unused")).await;
        assert_eq!(result.kind(), CacheResultType::Skipped);
        assert_eq!(delegate.fetch_count(), 0);
        assert!(delegate.was_skipped());
    }

    #[tokio::test]
    async fn test_fetch_many_retries_only_errors() {
        let delegate = Arc::new(ScriptedCache::new("scripted").with_fetch_results(vec![
            CacheResult::miss(),
            error("batch failed"),
            CacheResult::hit("scripted", ArtifactCacheMode::Http, Default::default(), 1),
        ]));
        let cache = RetryingCacheDecorator::new(delegate.clone(), 2).unwrap();
        let requests = vec![
            (RuleKey::from_hex("aa").unwrap(), PathBuf::from("/tmp/a")),
            (RuleKey::from_hex("bb").unwrap(), PathBuf::from("/tmp/b")),
        ];
        let results = cache.fetch_many(None, &requests).await;
        assert_eq!(results[0].kind(), CacheResultType::Miss);
        assert_eq!(results[1].kind(), CacheResultType::Hit);
        assert_eq!(results[1].attempts(), 2);
    }
}
