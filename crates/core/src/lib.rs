//! Artifact caching for build outputs
//!
//! This crate defines the [`ArtifactCache`] contract and everything that can
//! be built from local parts:
//! - Local backing stores: a sharded directory tree ([`DirArtifactCache`]),
//!   a SQLite database ([`SqliteArtifactCache`]) and a no-op placeholder
//! - Decorators: retries, event reporting, multi-tier fan-out and two-level
//!   pointer/blob storage
//! - A local content-addressed store for second-level blobs
//! - Configuration loading and validation
//!
//! # Results, not errors
//!
//! A fetch never fails with `Err`. Misses, transport failures and skipped
//! fetches are all [`CacheResult`] values, so a broken cache only ever costs a
//! rebuild. Stores, deletes and construction return [`Result`].
//!
//! # Composition
//!
//! Caches are composed as `Arc<dyn ArtifactCache>` chains:
//!
//! ```rust,ignore
//! let dir: SharedArtifactCache = Arc::new(DirArtifactCache::new("dir", root, mode, None, 4)?);
//! let logged = Arc::new(LoggingArtifactCacheDecorator::new(dir, sink));
//! let multi = Arc::new(MultiArtifactCache::new(vec![logged], StoreFailurePolicy::LogAndIgnore));
//! ```

pub mod cache;
pub mod cas;
pub mod config;
pub mod content_key;
pub mod dir;
mod error;
pub mod fs;
pub mod info;
pub mod logging;
pub mod multi;
pub mod noop;
pub mod result;
pub mod retrying;
pub mod rule_key;
pub mod second_level;
pub mod sqlite;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod two_level;
pub mod uploader;

pub use error::{Error, Result};

pub use cache::{ArtifactCache, SharedArtifactCache};
pub use cas::{ContentAddressedStorage, Digest, DirContentStore};
pub use config::{ArtifactCacheConfig, ByteSize, CacheConfig, StoreFailurePolicy};
pub use content_key::{ContentKeyKind, SecondLevelContentKey, TWO_LEVEL_CONTENT_KEY};
pub use dir::DirArtifactCache;
pub use info::{ArtifactInfo, ArtifactInfoBuilder, ArtifactSource};
pub use logging::LoggingArtifactCacheDecorator;
pub use multi::MultiArtifactCache;
pub use noop::NoopArtifactCache;
pub use result::{
    ArtifactCacheMode, CacheDeleteResult, CacheReadMode, CacheResult, CacheResultType, CacheType,
};
pub use retrying::RetryingCacheDecorator;
pub use rule_key::RuleKey;
pub use second_level::{HybridCasOptions, HybridCasSecondLevelCache, SecondLevelArtifactCache};
pub use sqlite::SqliteArtifactCache;
pub use two_level::{TwoLevelArtifactCacheDecorator, TwoLevelThresholds};
pub use uploader::{ArtifactUploader, pack, unpack};
