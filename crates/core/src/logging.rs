//! Event emission around a backing cache

use crate::cache::{ArtifactCache, SharedArtifactCache};
use crate::info::{ArtifactInfo, ArtifactSource};
use crate::result::{CacheDeleteResult, CacheReadMode, CacheResult, CacheResultType};
use crate::rule_key::RuleKey;
use crate::Result;
use artcache_events::{
    CacheEvent, EventCategory, FetchEvent, SharedEventSink, StoreEvent, emit_cache_error,
    emit_cache_hit, emit_cache_miss, emit_store_finished,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Reports every fetch and store outcome of its delegate to an event sink.
pub struct LoggingArtifactCacheDecorator {
    delegate: SharedArtifactCache,
    sink: SharedEventSink,
}

impl LoggingArtifactCacheDecorator {
    /// Wrap `delegate`, reporting to `sink`
    #[must_use]
    pub fn new(delegate: SharedArtifactCache, sink: SharedEventSink) -> Self {
        Self { delegate, sink }
    }

    fn report_fetch(&self, target: Option<&str>, key: &RuleKey, result: &CacheResult) {
        let cache = self.delegate.name();
        match result.kind() {
            CacheResultType::Hit | CacheResultType::LocalKeyUnchangedHit => {
                emit_cache_hit!(cache, key, result.artifact_size());
            }
            CacheResultType::Error => {
                emit_cache_error!(cache, key, result.cache_error().unwrap_or_default());
            }
            CacheResultType::Miss | CacheResultType::Skipped | CacheResultType::Contains => {
                emit_cache_miss!(cache, key);
            }
        }
        self.sink.emit(CacheEvent::new(EventCategory::Fetch(FetchEvent {
            cache: cache.to_string(),
            rule_key: key.to_hex(),
            target: target.map(str::to_string),
            outcome: result.kind().as_str().to_string(),
            artifact_size: result.artifact_size(),
            error: result.cache_error().map(str::to_string),
        })));
    }

    fn report_store(&self, info: &ArtifactInfo, size: Option<u64>, success: bool) {
        let rule_keys: Vec<String> = info.rule_keys().iter().map(RuleKey::to_hex).collect();
        emit_store_finished!(self.delegate.name(), &rule_keys, success);
        self.sink.emit(CacheEvent::new(EventCategory::Store(StoreEvent {
            cache: self.delegate.name().to_string(),
            rule_keys,
            artifact_size: size,
            success,
        })));
    }
}

#[async_trait]
impl ArtifactCache for LoggingArtifactCacheDecorator {
    fn name(&self) -> &str {
        self.delegate.name()
    }

    async fn fetch(&self, target: Option<&str>, key: &RuleKey, output: &Path) -> CacheResult {
        let result = self.delegate.fetch(target, key, output).await;
        self.report_fetch(target, key, &result);
        result
    }

    async fn fetch_many(
        &self,
        target: Option<&str>,
        requests: &[(RuleKey, PathBuf)],
    ) -> Vec<CacheResult> {
        let results = self.delegate.fetch_many(target, requests).await;
        for ((key, _), result) in requests.iter().zip(&results) {
            self.report_fetch(target, key, result);
        }
        results
    }

    async fn contains_many(&self, keys: &[RuleKey]) -> HashMap<RuleKey, CacheResult> {
        self.delegate.contains_many(keys).await
    }

    async fn store(&self, info: &ArtifactInfo, source: &ArtifactSource) -> Result<()> {
        // Measure before the delegate may move the source away
        let size = tokio::fs::metadata(source.path()).await.ok().map(|m| m.len());
        let outcome = self.delegate.store(info, source).await;
        self.report_store(info, size, outcome.is_ok());
        outcome
    }

    async fn delete(&self, keys: &[RuleKey]) -> Result<CacheDeleteResult> {
        self.delegate.delete(keys).await
    }

    fn read_mode(&self) -> CacheReadMode {
        self.delegate.read_mode()
    }

    fn skip_pending_and_future_fetches(&self) {
        self.delegate.skip_pending_and_future_fetches();
    }

    async fn close(&self) -> Result<()> {
        self.delegate.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryArtifactCache;
    use artcache_events::RecordingEventSink;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reports_fetch_and_store() {
        let tmp = TempDir::new().unwrap();
        let sink = Arc::new(RecordingEventSink::new());
        let inner = Arc::new(MemoryArtifactCache::new("mem"));
        let cache = LoggingArtifactCacheDecorator::new(inner, sink.clone());
        let key = RuleKey::from_hex("deadbeef").unwrap();

        let src = tmp.path().join("src");
        std::fs::write(&src, b"hello").unwrap();
        cache
            .store(&ArtifactInfo::for_key(key.clone()), &ArtifactSource::copy_from(&src))
            .await
            .unwrap();
        let hit = cache.fetch(Some("//a:b"), &key, &tmp.path().join("out")).await;
        assert!(hit.is_success());
        let miss_key = RuleKey::from_hex("cafef00d").unwrap();
        cache.fetch(None, &miss_key, &tmp.path().join("out2")).await;

        let events = sink.events();
        assert_eq!(events.len(), 3);
        match &events[0].category {
            EventCategory::Store(store) => {
                assert!(store.success);
                assert_eq!(store.artifact_size, Some(5));
                assert_eq!(store.rule_keys, vec!["deadbeef".to_string()]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match &events[1].category {
            EventCategory::Fetch(fetch) => {
                assert_eq!(fetch.outcome, "hit");
                assert_eq!(fetch.target.as_deref(), Some("//a:b"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        match &events[2].category {
            EventCategory::Fetch(fetch) => assert_eq!(fetch.outcome, "miss"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
