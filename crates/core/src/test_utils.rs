//! In-process caches for tests.
//!
//! [`MemoryArtifactCache`] is a working cache that keeps payloads in memory.
//! [`ScriptedCache`] replays a queue of fetch results and records every call.

use crate::cache::ArtifactCache;
use crate::fs::write_atomically;
use crate::info::{ArtifactInfo, ArtifactSource};
use crate::result::{ArtifactCacheMode, CacheDeleteResult, CacheReadMode, CacheResult};
use crate::rule_key::RuleKey;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Clone)]
struct StoredArtifact {
    metadata: BTreeMap<String, String>,
    content: Vec<u8>,
}

/// A working cache holding payloads in memory.
#[derive(Debug)]
pub struct MemoryArtifactCache {
    name: String,
    mode: CacheReadMode,
    entries: Mutex<HashMap<RuleKey, StoredArtifact>>,
    fetches: AtomicUsize,
    stores: AtomicUsize,
    fail_stores: AtomicBool,
    skipped: AtomicBool,
    closed: AtomicUsize,
}

impl MemoryArtifactCache {
    /// Empty read-write cache
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_mode(name, CacheReadMode::ReadWrite)
    }

    /// Empty cache with the given read mode
    #[must_use]
    pub fn with_mode(name: impl Into<String>, mode: CacheReadMode) -> Self {
        Self {
            name: name.into(),
            mode,
            entries: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
            stores: AtomicUsize::new(0),
            fail_stores: AtomicBool::new(false),
            skipped: AtomicBool::new(false),
            closed: AtomicUsize::new(0),
        }
    }

    /// Seed an entry directly, bypassing the read mode.
    pub fn insert(&self, key: RuleKey, metadata: BTreeMap<String, String>, content: &[u8]) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                key,
                StoredArtifact {
                    metadata,
                    content: content.to_vec(),
                },
            );
        }
    }

    /// Make every subsequent store fail
    pub fn fail_stores(&self) {
        self.fail_stores.store(true, Ordering::Release);
    }

    /// Stored payload for `key`
    #[must_use]
    pub fn content(&self, key: &RuleKey) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(key).map(|e| e.content.clone()))
    }

    /// Stored metadata for `key`
    #[must_use]
    pub fn metadata(&self, key: &RuleKey) -> Option<BTreeMap<String, String>> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(key).map(|e| e.metadata.clone()))
    }

    /// Whether `key` is stored
    #[must_use]
    pub fn contains(&self, key: &RuleKey) -> bool {
        self.content(key).is_some()
    }

    /// Number of stored keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or_default()
    }

    /// Whether nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of fetch calls
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Acquire)
    }

    /// Number of store calls that reached a writable cache
    #[must_use]
    pub fn store_count(&self) -> usize {
        self.stores.load(Ordering::Acquire)
    }

    /// Number of close calls
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether skip was forwarded to this cache
    #[must_use]
    pub fn was_skipped(&self) -> bool {
        self.skipped.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ArtifactCache for MemoryArtifactCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, _target: Option<&str>, key: &RuleKey, output: &Path) -> CacheResult {
        self.fetches.fetch_add(1, Ordering::AcqRel);
        if self.skipped.load(Ordering::Acquire) {
            return CacheResult::skipped();
        }
        let stored = self
            .entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(key).cloned());
        let Some(stored) = stored else {
            return CacheResult::miss();
        };
        match write_atomically(output, &stored.content) {
            Ok(()) => CacheResult::hit(
                &self.name,
                ArtifactCacheMode::Dir,
                stored.metadata,
                stored.content.len() as u64,
            ),
            Err(e) => CacheResult::error(&self.name, ArtifactCacheMode::Dir, e.to_string()),
        }
    }

    async fn contains_many(&self, keys: &[RuleKey]) -> HashMap<RuleKey, CacheResult> {
        keys.iter()
            .map(|key| {
                let result = if self.contains(key) {
                    CacheResult::contains(&self.name, ArtifactCacheMode::Dir)
                } else {
                    CacheResult::miss()
                };
                (key.clone(), result)
            })
            .collect()
    }

    async fn store(&self, info: &ArtifactInfo, source: &ArtifactSource) -> Result<()> {
        if !self.mode.is_writable() {
            return Ok(());
        }
        self.stores.fetch_add(1, Ordering::AcqRel);
        if self.fail_stores.load(Ordering::Acquire) {
            return Err(Error::backend(&self.name, "store rejected"));
        }
        let content = tokio::fs::read(source.path())
            .await
            .map_err(|e| Error::io(e, source.path(), "read"))?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::backend(&self.name, "poisoned"))?;
        for key in info.rule_keys() {
            entries.insert(
                key.clone(),
                StoredArtifact {
                    metadata: info.metadata().clone(),
                    content: content.clone(),
                },
            );
        }
        Ok(())
    }

    async fn delete(&self, keys: &[RuleKey]) -> Result<CacheDeleteResult> {
        if !self.mode.is_writable() {
            return Ok(CacheDeleteResult::for_cache(&self.name, BTreeSet::new()));
        }
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::backend(&self.name, "poisoned"))?;
        let deleted = keys
            .iter()
            .filter(|key| entries.remove(*key).is_some())
            .cloned()
            .collect();
        Ok(CacheDeleteResult::for_cache(&self.name, deleted))
    }

    fn read_mode(&self) -> CacheReadMode {
        self.mode
    }

    fn skip_pending_and_future_fetches(&self) {
        self.skipped.store(true, Ordering::Release);
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// A cache that replays queued fetch results.
///
/// Once the queue is empty every fetch misses. Hits do not write the
/// destination unless a payload was set with [`ScriptedCache::with_payload`].
#[derive(Debug)]
pub struct ScriptedCache {
    name: String,
    mode: CacheReadMode,
    fetch_results: Mutex<VecDeque<CacheResult>>,
    payload: Option<Vec<u8>>,
    fetched: Mutex<Vec<RuleKey>>,
    stored: Mutex<Vec<ArtifactInfo>>,
    skipped: AtomicBool,
}

impl ScriptedCache {
    /// Read-write cache with an empty script
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: CacheReadMode::ReadWrite,
            fetch_results: Mutex::new(VecDeque::new()),
            payload: None,
            fetched: Mutex::new(Vec::new()),
            stored: Mutex::new(Vec::new()),
            skipped: AtomicBool::new(false),
        }
    }

    /// Queue fetch results
    #[must_use]
    pub fn with_fetch_results(self, results: Vec<CacheResult>) -> Self {
        Self {
            fetch_results: Mutex::new(results.into()),
            ..self
        }
    }

    /// Bytes written to the destination on hits
    #[must_use]
    pub fn with_payload(self, payload: &[u8]) -> Self {
        Self {
            payload: Some(payload.to_vec()),
            ..self
        }
    }

    /// Change the read mode
    #[must_use]
    pub fn with_mode(self, mode: CacheReadMode) -> Self {
        Self { mode, ..self }
    }

    /// Number of fetch calls
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetched.lock().map(|f| f.len()).unwrap_or_default()
    }

    /// Keys fetched, in call order
    #[must_use]
    pub fn fetched_keys(&self) -> Vec<RuleKey> {
        self.fetched.lock().map(|f| f.clone()).unwrap_or_default()
    }

    /// Infos passed to store, in call order
    #[must_use]
    pub fn stored_infos(&self) -> Vec<ArtifactInfo> {
        self.stored.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Whether skip was forwarded to this cache
    #[must_use]
    pub fn was_skipped(&self) -> bool {
        self.skipped.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ArtifactCache for ScriptedCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, _target: Option<&str>, key: &RuleKey, output: &Path) -> CacheResult {
        if let Ok(mut fetched) = self.fetched.lock() {
            fetched.push(key.clone());
        }
        let result = self
            .fetch_results
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .unwrap_or_else(CacheResult::miss);
        if result.is_success() {
            if let Some(payload) = &self.payload {
                if let Err(e) = write_atomically(output, payload) {
                    return CacheResult::error(&self.name, ArtifactCacheMode::Http, e.to_string());
                }
            }
        }
        result
    }

    async fn store(&self, info: &ArtifactInfo, _source: &ArtifactSource) -> Result<()> {
        if let Ok(mut stored) = self.stored.lock() {
            stored.push(info.clone());
        }
        Ok(())
    }

    async fn delete(&self, keys: &[RuleKey]) -> Result<CacheDeleteResult> {
        Ok(CacheDeleteResult::for_cache(
            &self.name,
            keys.iter().cloned().collect(),
        ))
    }

    fn read_mode(&self) -> CacheReadMode {
        self.mode
    }

    fn skip_pending_and_future_fetches(&self) {
        self.skipped.store(true, Ordering::Release);
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
