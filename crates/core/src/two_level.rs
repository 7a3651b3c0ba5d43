//! Pointer/blob indirection for large artifacts

use crate::cache::{ArtifactCache, SharedArtifactCache};
use crate::content_key::{SecondLevelContentKey, TWO_LEVEL_CONTENT_KEY};
use crate::fs::remove_if_exists;
use crate::info::{ArtifactInfo, ArtifactSource};
use crate::result::{CacheDeleteResult, CacheReadMode, CacheResult, CacheResultType};
use crate::rule_key::RuleKey;
use crate::second_level::SecondLevelArtifactCache;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use tracing::{debug, warn};

/// Size window for artifacts that go through the second level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwoLevelThresholds {
    /// Whether new stores use pointers at all
    pub enabled: bool,
    /// Smallest payload stored behind a pointer
    pub min_size: u64,
    /// Largest payload stored behind a pointer
    pub max_size: Option<u64>,
}

impl TwoLevelThresholds {
    /// Thresholds that store everything directly
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            min_size: 0,
            max_size: None,
        }
    }

    fn accepts(&self, size: u64) -> bool {
        self.enabled && size >= self.min_size && self.max_size.is_none_or(|max| size <= max)
    }
}

/// Stores large payloads once in a second level and keeps small pointer
/// records in the delegate.
///
/// Fetch understands both pointer records and direct artifacts, whatever the
/// current thresholds.
pub struct TwoLevelArtifactCacheDecorator {
    delegate: SharedArtifactCache,
    second_level: Arc<dyn SecondLevelArtifactCache>,
    thresholds: TwoLevelThresholds,
}

/// A store ready to hand to the delegate. Holds the pointer file alive.
struct PreparedStore {
    info: ArtifactInfo,
    source: ArtifactSource,
    pointer: Option<TempPath>,
}

impl TwoLevelArtifactCacheDecorator {
    /// Wrap `delegate`, putting large payloads into `second_level`
    #[must_use]
    pub fn new(
        delegate: SharedArtifactCache,
        second_level: Arc<dyn SecondLevelArtifactCache>,
        thresholds: TwoLevelThresholds,
    ) -> Self {
        Self {
            delegate,
            second_level,
            thresholds,
        }
    }

    /// Turn a pointer hit into a blob hit. Other results pass through.
    async fn resolve(&self, target: Option<&str>, output: &Path, result: CacheResult) -> CacheResult {
        if result.kind() != CacheResultType::Hit {
            return result;
        }
        let Some(raw) = result.metadata().get(TWO_LEVEL_CONTENT_KEY).cloned() else {
            return result;
        };
        let content_key = SecondLevelContentKey::parse(&raw);
        match self.second_level.fetch(target, &content_key, output).await {
            Ok(Some(size)) => {
                debug!(content_key = %content_key, size, "Resolved two-level pointer");
                result
                    .with_artifact_size(size)
                    .with_two_level_content_key(raw)
            }
            Ok(None) => {
                warn!(
                    cache = %self.delegate.name(),
                    content_key = %content_key,
                    "Dangling two-level pointer, treating as miss"
                );
                let _ = remove_if_exists(output);
                CacheResult::miss()
            }
            Err(e) => {
                let _ = remove_if_exists(output);
                result.into_error(format!("second-level fetch of {content_key} failed: {e}"))
            }
        }
    }

    async fn prepare(&self, info: &ArtifactInfo, source: &ArtifactSource) -> Result<PreparedStore> {
        let size = tokio::fs::metadata(source.path())
            .await
            .map_err(|e| Error::io(e, source.path(), "metadata"))?
            .len();

        if !self.thresholds.accepts(size) {
            // A direct artifact must never look like a pointer
            let info = if info.metadata().contains_key(TWO_LEVEL_CONTENT_KEY) {
                info.to_builder().without_metadata(TWO_LEVEL_CONTENT_KEY).build()?
            } else {
                info.clone()
            };
            return Ok(PreparedStore {
                info,
                source: source.clone(),
                pointer: None,
            });
        }

        let content_key = self
            .second_level
            .store(info.build_target(), source.path())
            .await?;
        debug!(content_key = %content_key, size, "Stored second-level blob");

        let pointer = tempfile::Builder::new()
            .prefix(".artcache-pointer")
            .tempfile()
            .map_err(|e| Error::io_no_path(e, "create pointer"))?
            .into_temp_path();
        let info = info
            .to_builder()
            .metadata(TWO_LEVEL_CONTENT_KEY, content_key.as_str())
            .build()?;
        Ok(PreparedStore {
            info,
            source: ArtifactSource::move_from(pointer.to_path_buf()),
            pointer: Some(pointer),
        })
    }
}

#[async_trait]
impl ArtifactCache for TwoLevelArtifactCacheDecorator {
    fn name(&self) -> &str {
        self.delegate.name()
    }

    async fn fetch(&self, target: Option<&str>, key: &RuleKey, output: &Path) -> CacheResult {
        let result = self.delegate.fetch(target, key, output).await;
        self.resolve(target, output, result).await
    }

    async fn fetch_many(
        &self,
        target: Option<&str>,
        requests: &[(RuleKey, PathBuf)],
    ) -> Vec<CacheResult> {
        let results = self.delegate.fetch_many(target, requests).await;
        futures::future::join_all(
            requests
                .iter()
                .zip(results)
                .map(|((_, output), result)| self.resolve(target, output, result)),
        )
        .await
    }

    async fn contains_many(&self, keys: &[RuleKey]) -> HashMap<RuleKey, CacheResult> {
        self.delegate.contains_many(keys).await
    }

    async fn store(&self, info: &ArtifactInfo, source: &ArtifactSource) -> Result<()> {
        if !self.delegate.read_mode().is_writable() {
            return Ok(());
        }
        let prepared = self.prepare(info, source).await?;
        self.delegate.store(&prepared.info, &prepared.source).await
    }

    async fn store_many(&self, artifacts: Vec<(ArtifactInfo, ArtifactSource)>) -> Result<()> {
        if !self.delegate.read_mode().is_writable() {
            return Ok(());
        }
        let mut batch = Vec::with_capacity(artifacts.len());
        let mut pointers = Vec::new();
        for (info, source) in &artifacts {
            let prepared = self.prepare(info, source).await?;
            pointers.extend(prepared.pointer);
            batch.push((prepared.info, prepared.source));
        }
        let outcome = self.delegate.store_many(batch).await;
        drop(pointers);
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
        let primary = self.delegate.close().await;
        let second = self.second_level.close().await;
        primary.and(second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::second_level::{HybridCasOptions, HybridCasSecondLevelCache};
    use crate::test_utils::MemoryArtifactCache;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn key(hex: &str) -> RuleKey {
        RuleKey::from_hex(hex).unwrap()
    }

    fn setup(min_size: u64) -> (Arc<MemoryArtifactCache>, TwoLevelArtifactCacheDecorator) {
        let primary = Arc::new(MemoryArtifactCache::new("primary"));
        let second = HybridCasSecondLevelCache::new(primary.clone(), None, HybridCasOptions::default()).unwrap();
        let cache = TwoLevelArtifactCacheDecorator::new(
            primary.clone(),
            Arc::new(second),
            TwoLevelThresholds {
                enabled: true,
                min_size,
                max_size: Some(1024),
            },
        );
        (primary, cache)
    }

    #[tokio::test]
    async fn test_large_payload_goes_through_pointer() {
        let tmp = TempDir::new().unwrap();
        let (primary, cache) = setup(4);
        let src = tmp.path().join("src");
        std::fs::write(&src, b"0123456789").unwrap();

        cache
            .store(&ArtifactInfo::for_key(key("aaaa")), &ArtifactSource::copy_from(&src))
            .await
            .unwrap();

        // Pointer is empty and carries the content key
        assert_eq!(primary.content(&key("aaaa")).unwrap(), Vec::<u8>::new());
        let metadata = primary.metadata(&key("aaaa")).unwrap();
        let raw = metadata.get(TWO_LEVEL_CONTENT_KEY).unwrap();
        assert!(raw.starts_with("cache/"));

        let out = tmp.path().join("out");
        let result = cache.fetch(None, &key("aaaa"), &out).await;
        assert_eq!(result.kind(), CacheResultType::Hit);
        assert_eq!(result.artifact_size(), Some(10));
        assert_eq!(result.two_level_content_key(), Some(raw.as_str()));
        assert_eq!(std::fs::read(&out).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_small_and_oversized_payloads_stored_directly() {
        let tmp = TempDir::new().unwrap();
        let (primary, cache) = setup(4);
        let small = tmp.path().join("small");
        std::fs::write(&small, b"abc").unwrap();
        let big = tmp.path().join("big");
        std::fs::write(&big, vec![7u8; 2048]).unwrap();

        cache
            .store(&ArtifactInfo::for_key(key("aa")), &ArtifactSource::copy_from(&small))
            .await
            .unwrap();
        cache
            .store(&ArtifactInfo::for_key(key("bb")), &ArtifactSource::copy_from(&big))
            .await
            .unwrap();
        assert_eq!(primary.content(&key("aa")).unwrap(), b"abc");
        assert_eq!(primary.content(&key("bb")).unwrap().len(), 2048);
        assert_eq!(primary.len(), 2);
    }

    #[tokio::test]
    async fn test_direct_store_strips_pointer_metadata() {
        let tmp = TempDir::new().unwrap();
        let (primary, cache) = setup(100);
        let src = tmp.path().join("src");
        std::fs::write(&src, b"tiny").unwrap();
        let info = ArtifactInfo::builder()
            .rule_key(key("cc"))
            .metadata(TWO_LEVEL_CONTENT_KEY, "cache/forged")
            .build()
            .unwrap();
        cache.store(&info, &ArtifactSource::copy_from(&src)).await.unwrap();
        assert!(!primary.metadata(&key("cc")).unwrap().contains_key(TWO_LEVEL_CONTENT_KEY));
    }

    #[tokio::test]
    async fn test_dangling_pointer_is_miss() {
        let tmp = TempDir::new().unwrap();
        let (primary, cache) = setup(4);
        let metadata = BTreeMap::from([(
            TWO_LEVEL_CONTENT_KEY.to_string(),
            SecondLevelContentKey::cache(&crate::cas::Digest::of(b"gone")).to_string(),
        )]);
        primary.insert(key("dd"), metadata, b"");

        let out = tmp.path().join("out");
        let result = cache.fetch(None, &key("dd"), &out).await;
        assert_eq!(result.kind(), CacheResultType::Miss);
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_unknown_content_key_is_error() {
        let tmp = TempDir::new().unwrap();
        let (primary, cache) = setup(4);
        let metadata = BTreeMap::from([(TWO_LEVEL_CONTENT_KEY.to_string(), "s3/xyz".to_string())]);
        primary.insert(key("ee"), metadata, b"");

        let out = tmp.path().join("out");
        let result = cache.fetch(None, &key("ee"), &out).await;
        assert_eq!(result.kind(), CacheResultType::Error);
        assert_eq!(result.cache_source(), Some("primary"));
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_fetch_many_resolves_each_pointer() {
        let tmp = TempDir::new().unwrap();
        let (_primary, cache) = setup(4);
        let src = tmp.path().join("src");
        std::fs::write(&src, b"shared payload").unwrap();
        cache
            .store_many(vec![
                (ArtifactInfo::for_key(key("01")), ArtifactSource::copy_from(&src)),
                (ArtifactInfo::for_key(key("02")), ArtifactSource::copy_from(&src)),
            ])
            .await
            .unwrap();

        let requests = vec![
            (key("01"), tmp.path().join("o1")),
            (key("02"), tmp.path().join("o2")),
            (key("03"), tmp.path().join("o3")),
        ];
        let results = cache.fetch_many(None, &requests).await;
        assert_eq!(results[0].kind(), CacheResultType::Hit);
        assert_eq!(results[1].kind(), CacheResultType::Hit);
        assert_eq!(results[2].kind(), CacheResultType::Miss);
        assert_eq!(std::fs::read(tmp.path().join("o2")).unwrap(), b"shared payload");
    }

    #[tokio::test]
    async fn test_readonly_delegate_ignores_stores() {
        let tmp = TempDir::new().unwrap();
        let primary = Arc::new(MemoryArtifactCache::with_mode("ro", CacheReadMode::ReadOnly));
        let second = HybridCasSecondLevelCache::new(primary.clone(), None, HybridCasOptions::default()).unwrap();
        let cache = TwoLevelArtifactCacheDecorator::new(
            primary.clone(),
            Arc::new(second),
            TwoLevelThresholds {
                enabled: true,
                min_size: 0,
                max_size: None,
            },
        );
        let src = tmp.path().join("src");
        std::fs::write(&src, b"data").unwrap();
        cache
            .store(&ArtifactInfo::for_key(key("aa")), &ArtifactSource::copy_from(&src))
            .await
            .unwrap();
        assert!(primary.is_empty());
    }

    #[test]
    fn test_thresholds() {
        let t = TwoLevelThresholds {
            enabled: true,
            min_size: 10,
            max_size: Some(20),
        };
        assert!(!t.accepts(9));
        assert!(t.accepts(10));
        assert!(t.accepts(20));
        assert!(!t.accepts(21));
        assert!(!TwoLevelThresholds::disabled().accepts(1_000));
    }
}
