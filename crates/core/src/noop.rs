//! Cache used when no backing store is configured

use crate::cache::ArtifactCache;
use crate::info::{ArtifactInfo, ArtifactSource};
use crate::result::{CacheDeleteResult, CacheReadMode, CacheResult};
use crate::rule_key::RuleKey;
use crate::Result;
use async_trait::async_trait;
use std::path::Path;

/// Misses every fetch and discards every store.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopArtifactCache;

impl NoopArtifactCache {
    /// Create a noop cache
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ArtifactCache for NoopArtifactCache {
    fn name(&self) -> &str {
        "noop"
    }

    async fn fetch(&self, _target: Option<&str>, _key: &RuleKey, _output: &Path) -> CacheResult {
        CacheResult::miss()
    }

    async fn store(&self, _info: &ArtifactInfo, _source: &ArtifactSource) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _keys: &[RuleKey]) -> Result<CacheDeleteResult> {
        Ok(CacheDeleteResult::default())
    }

    fn read_mode(&self) -> CacheReadMode {
        CacheReadMode::ReadOnly
    }

    fn skip_pending_and_future_fetches(&self) {}

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
