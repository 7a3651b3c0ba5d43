//! Second-level blob storage behind two-level pointers

use crate::cache::SharedArtifactCache;
use crate::cas::{ContentAddressedStorage, Digest};
use crate::content_key::{ContentKeyKind, SecondLevelContentKey};
use crate::fs::remove_if_exists;
use crate::info::{ArtifactInfo, ArtifactSource};
use crate::result::CacheResultType;
use crate::rule_key::RuleKey;
use crate::{Error, Result};
use async_trait::async_trait;
use sha2::{Digest as _, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Storage for blobs referenced by two-level pointers.
#[async_trait]
pub trait SecondLevelArtifactCache: Send + Sync {
    /// Store the blob at `source` and return the key a pointer should carry.
    ///
    /// Storing content that is already present is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the blob could not be stored
    async fn store(&self, target: Option<&str>, source: &Path) -> Result<SecondLevelContentKey>;

    /// Materialize the blob for `key` at `output`.
    ///
    /// Returns the blob size, or `None` if the blob is absent.
    ///
    /// # Errors
    ///
    /// Returns error if the blob exists but could not be fetched, or if the
    /// key is not a recognized form
    async fn fetch(
        &self,
        target: Option<&str>,
        key: &SecondLevelContentKey,
        output: &Path,
    ) -> Result<Option<u64>>;

    /// Release resources owned by the second level
    ///
    /// # Errors
    ///
    /// Returns error if teardown fails
    async fn close(&self) -> Result<()>;
}

/// Settings for [`HybridCasSecondLevelCache`].
#[derive(Debug, Clone, Default)]
pub struct HybridCasOptions {
    /// Write blobs to the CAS when one is present
    pub write_to_cas: bool,
    /// Also keep a primary-cache copy of CAS blobs
    pub double_write: bool,
    /// Percentage of `cache/` reads tried against the CAS first
    pub cas_read_percentage: u8,
    /// Smallest blob written to the CAS
    pub cas_min_size: u64,
    /// Stable per-build identifier used to pick CAS reads
    pub invocation_id: String,
}

/// Second level that stores blobs in the primary cache, the CAS, or both.
pub struct HybridCasSecondLevelCache {
    primary: SharedArtifactCache,
    cas: Option<Arc<dyn ContentAddressedStorage>>,
    options: HybridCasOptions,
}

impl HybridCasSecondLevelCache {
    /// Create a second level over `primary` and an optional CAS.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `cas_read_percentage` exceeds 100
    pub fn new(
        primary: SharedArtifactCache,
        cas: Option<Arc<dyn ContentAddressedStorage>>,
        options: HybridCasOptions,
    ) -> Result<Self> {
        if options.cas_read_percentage > 100 {
            return Err(Error::configuration(format!(
                "cas_read_percentage must be between 0 and 100, got {}",
                options.cas_read_percentage
            )));
        }
        Ok(Self {
            primary,
            cas,
            options,
        })
    }

    /// Whether a `cache/` read for `hash` goes to the CAS first.
    ///
    /// Deterministic for a given invocation and hash.
    #[must_use]
    pub fn reads_from_cas(&self, hash: &str) -> bool {
        if self.cas.is_none() || self.options.cas_read_percentage == 0 {
            return false;
        }
        let mut hasher = Sha256::new();
        hasher.update(self.options.invocation_id.as_bytes());
        hasher.update(hash.as_bytes());
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(head) % 100 < u64::from(self.options.cas_read_percentage)
    }

    async fn store_in_primary(
        &self,
        digest: &Digest,
        target: Option<&str>,
        source: &Path,
    ) -> Result<()> {
        let blob_key = RuleKey::from_hex(digest.hash())?;
        let present = self.primary.contains_many(std::slice::from_ref(&blob_key)).await;
        if present
            .get(&blob_key)
            .is_some_and(|r| r.kind() == CacheResultType::Contains)
        {
            debug!(digest = %digest, "Second-level blob already in primary cache");
            return Ok(());
        }
        let mut builder = ArtifactInfo::builder().rule_key(blob_key);
        if let Some(target) = target {
            builder = builder.build_target(target);
        }
        self.primary
            .store(&builder.build()?, &ArtifactSource::copy_from(source))
            .await
    }

    async fn store_in_cas(
        &self,
        cas: &dyn ContentAddressedStorage,
        digest: &Digest,
        source: &Path,
    ) -> Result<()> {
        let missing = cas.find_missing(std::slice::from_ref(digest)).await?;
        if missing.is_empty() {
            debug!(digest = %digest, cas = %cas.name(), "Blob already in CAS");
            return Ok(());
        }
        cas.upload(digest, source).await
    }

    async fn fetch_from_primary(
        &self,
        target: Option<&str>,
        blob_key: &RuleKey,
        expected_size: Option<u64>,
        output: &Path,
    ) -> Result<Option<u64>> {
        let result = self.primary.fetch(target, blob_key, output).await;
        match result.kind() {
            CacheResultType::Hit => {
                let size = tokio::fs::metadata(output)
                    .await
                    .map_err(|e| Error::io(e, output, "metadata"))?
                    .len();
                if let Some(expected) = expected_size {
                    if expected != size {
                        remove_if_exists(output)?;
                        return Err(Error::backend(
                            self.primary.name(),
                            format!("second-level blob {blob_key} has {size} bytes, expected {expected}"),
                        ));
                    }
                }
                Ok(Some(size))
            }
            CacheResultType::Error => Err(Error::backend(
                result.cache_source().unwrap_or(self.primary.name()),
                result.cache_error().unwrap_or("second-level fetch failed"),
            )),
            _ => Ok(None),
        }
    }

    async fn fetch_from_cas(&self, digest: &Digest, output: &Path) -> Result<Option<u64>> {
        let Some(cas) = &self.cas else {
            return Err(Error::configuration(format!(
                "Blob {digest} is stored in a CAS but none is configured"
            )));
        };
        if cas.fetch_to(digest, output).await? {
            Ok(Some(digest.size()))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl SecondLevelArtifactCache for HybridCasSecondLevelCache {
    async fn store(&self, target: Option<&str>, source: &Path) -> Result<SecondLevelContentKey> {
        let path = source.to_path_buf();
        let digest = tokio::task::spawn_blocking(move || Digest::of_file(&path))
            .await
            .map_err(|e| Error::task("digest", &e))??;

        if let Some(cas) = &self.cas {
            if self.options.write_to_cas && digest.size() >= self.options.cas_min_size {
                self.store_in_cas(cas.as_ref(), &digest, source).await?;
                if self.options.double_write {
                    self.store_in_primary(&digest, target, source).await?;
                }
                return Ok(SecondLevelContentKey::cas(&digest));
            }
        }
        self.store_in_primary(&digest, target, source).await?;
        Ok(SecondLevelContentKey::cache(&digest))
    }

    async fn fetch(
        &self,
        target: Option<&str>,
        key: &SecondLevelContentKey,
        output: &Path,
    ) -> Result<Option<u64>> {
        match key.kind() {
            ContentKeyKind::CasOnly => {
                let digest = key
                    .digest()
                    .ok_or_else(|| Error::invalid_key(format!("Malformed content key {key}")))?;
                self.fetch_from_cas(&digest, output).await
            }
            ContentKeyKind::CacheOnly => {
                let digest = key
                    .digest()
                    .ok_or_else(|| Error::invalid_key(format!("Malformed content key {key}")))?;
                if self.reads_from_cas(digest.hash()) {
                    match self.fetch_from_cas(&digest, output).await {
                        Ok(Some(size)) => return Ok(Some(size)),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(digest = %digest, error = %e, "CAS read failed, using primary cache");
                        }
                    }
                }
                let blob_key = RuleKey::from_hex(digest.hash())?;
                self.fetch_from_primary(target, &blob_key, Some(digest.size()), output)
                    .await
            }
            ContentKeyKind::OldStyle => {
                let blob_key = key
                    .primary_rule_key()
                    .ok_or_else(|| Error::invalid_key(format!("Malformed content key {key}")))?;
                self.fetch_from_primary(target, &blob_key, None, output).await
            }
            ContentKeyKind::Unknown => Err(Error::invalid_key(format!(
                "Unknown second-level content key '{key}'"
            ))),
        }
    }

    async fn close(&self) -> Result<()> {
        match &self.cas {
            Some(cas) => cas.close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::DirContentStore;
    use crate::test_utils::MemoryArtifactCache;
    use tempfile::TempDir;

    fn write(tmp: &TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = tmp.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[tokio::test]
    async fn test_primary_only_roundtrip_dedups() {
        let tmp = TempDir::new().unwrap();
        let primary = Arc::new(MemoryArtifactCache::new("primary"));
        let second = HybridCasSecondLevelCache::new(primary.clone(), None, HybridCasOptions::default()).unwrap();

        let src = write(&tmp, "src", b"large blob");
        let key1 = second.store(None, &src).await.unwrap();
        let key2 = second.store(None, &src).await.unwrap();
        assert_eq!(key1, key2);
        assert_eq!(key1.kind(), ContentKeyKind::CacheOnly);
        assert_eq!(primary.len(), 1);
        assert_eq!(primary.store_count(), 1);

        let out = tmp.path().join("out");
        assert_eq!(second.fetch(None, &key1, &out).await.unwrap(), Some(10));
        assert_eq!(std::fs::read(&out).unwrap(), b"large blob");
    }

    #[tokio::test]
    async fn test_cas_write_and_double_write() {
        let tmp = TempDir::new().unwrap();
        let primary = Arc::new(MemoryArtifactCache::new("primary"));
        let cas = Arc::new(DirContentStore::new(tmp.path().join("cas")));
        let second = HybridCasSecondLevelCache::new(
            primary.clone(),
            Some(cas.clone()),
            HybridCasOptions {
                write_to_cas: true,
                double_write: true,
                ..Default::default()
            },
        )
        .unwrap();

        let src = write(&tmp, "src", b"blob");
        let key = second.store(None, &src).await.unwrap();
        assert_eq!(key.kind(), ContentKeyKind::CasOnly);
        assert_eq!(cas.list().unwrap().len(), 1);
        assert_eq!(primary.len(), 1);

        let out = tmp.path().join("out");
        assert_eq!(second.fetch(None, &key, &out).await.unwrap(), Some(4));
        assert_eq!(std::fs::read(&out).unwrap(), b"blob");
    }

    #[tokio::test]
    async fn test_small_blobs_skip_cas() {
        let tmp = TempDir::new().unwrap();
        let primary = Arc::new(MemoryArtifactCache::new("primary"));
        let cas = Arc::new(DirContentStore::new(tmp.path().join("cas")));
        let second = HybridCasSecondLevelCache::new(
            primary.clone(),
            Some(cas.clone()),
            HybridCasOptions {
                write_to_cas: true,
                cas_min_size: 100,
                ..Default::default()
            },
        )
        .unwrap();
        let key = second.store(None, &write(&tmp, "src", b"tiny")).await.unwrap();
        assert_eq!(key.kind(), ContentKeyKind::CacheOnly);
        assert!(cas.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_blob_is_none() {
        let tmp = TempDir::new().unwrap();
        let primary = Arc::new(MemoryArtifactCache::new("primary"));
        let second = HybridCasSecondLevelCache::new(primary, None, HybridCasOptions::default()).unwrap();
        let key = SecondLevelContentKey::cache(&Digest::of(b"never stored"));
        assert_eq!(second.fetch(None, &key, &tmp.path().join("out")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_and_unconfigured_cas_are_errors() {
        let tmp = TempDir::new().unwrap();
        let primary = Arc::new(MemoryArtifactCache::new("primary"));
        let second = HybridCasSecondLevelCache::new(primary, None, HybridCasOptions::default()).unwrap();
        let out = tmp.path().join("out");
        assert!(second.fetch(None, &SecondLevelContentKey::parse("s3/x"), &out).await.is_err());
        let cas_key = SecondLevelContentKey::cas(&Digest::of(b"x"));
        assert!(second.fetch(None, &cas_key, &out).await.is_err());
    }

    #[tokio::test]
    async fn test_old_style_key_reads_primary() {
        let tmp = TempDir::new().unwrap();
        let primary = Arc::new(MemoryArtifactCache::new("primary"));
        primary.insert(RuleKey::from_hex("abcd").unwrap(), Default::default(), b"legacy");
        let second = HybridCasSecondLevelCache::new(primary, None, HybridCasOptions::default()).unwrap();
        let out = tmp.path().join("out");
        let key = SecondLevelContentKey::parse("abcd");
        assert_eq!(second.fetch(None, &key, &out).await.unwrap(), Some(6));
    }

    #[test]
    fn test_read_percentage_selection() {
        let primary = Arc::new(MemoryArtifactCache::new("primary"));
        let cas: Arc<dyn ContentAddressedStorage> = Arc::new(DirContentStore::new("/unused"));
        let options = |pct| HybridCasOptions {
            cas_read_percentage: pct,
            invocation_id: "build-1".to_string(),
            ..Default::default()
        };
        let none = HybridCasSecondLevelCache::new(primary.clone(), Some(cas.clone()), options(0)).unwrap();
        let all = HybridCasSecondLevelCache::new(primary.clone(), Some(cas.clone()), options(100)).unwrap();
        let half = HybridCasSecondLevelCache::new(primary.clone(), Some(cas), options(50)).unwrap();
        let hashes: Vec<String> = (0..200).map(|i| Digest::of(&[i as u8, 7]).hash().to_string()).collect();

        assert!(hashes.iter().all(|h| !none.reads_from_cas(h)));
        assert!(hashes.iter().all(|h| all.reads_from_cas(h)));
        let picked = hashes.iter().filter(|h| half.reads_from_cas(h)).count();
        assert!(picked > 40 && picked < 160, "picked {picked}");
        // Deterministic for the same invocation
        assert!(hashes.iter().all(|h| half.reads_from_cas(h) == half.reads_from_cas(h)));
        assert!(HybridCasSecondLevelCache::new(primary, None, options(101)).is_err());
    }
}
