//! Artifact caches built from configuration.
//!
//! [`ArtifactCaches`] turns an [`artcache_core::ArtifactCacheConfig`] into a
//! ready cache graph: local directory and SQLite tiers, retrying network
//! tiers, fan-in through a multi-cache, and two-level storage on top.
//!
//! ```rust,ignore
//! use artcache::{ArtifactCaches, CacheEnvironment};
//! use artcache_core::ArtifactCacheConfig;
//!
//! let config = ArtifactCacheConfig::load(path)?;
//! let caches = ArtifactCaches::new(config, CacheEnvironment::from_process(sink))?;
//! let cache = caches.new_instance()?;
//! // ... fetch and store ...
//! caches.close().await;
//! ```

pub mod factory;

pub use factory::{ArtifactCaches, CacheEnvironment, HOST_HEADER, USER_HEADER};
