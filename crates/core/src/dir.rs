//! Local directory cache
//!
//! ## Layout
//!
//! ```text
//! <root>/
//!   de/
//!     ad/
//!       deadbeef           (entry)
//! ```
//!
//! An entry is a single file: a `u32` big-endian header length, the JSON
//! encoded [`ArtifactInfo`], then the payload. Entries are published through
//! a temp file in their final directory and an atomic rename, and a fetch
//! reads header and payload through one open handle, so it sees either the
//! previous entry, nothing, or the new entry. Metadata and payload of two
//! different stores are never paired.

use crate::cache::ArtifactCache;
use crate::config::DirCacheEntry;
use crate::fs::{persist, remove_if_exists, temp_file_beside};
use crate::info::{ArtifactInfo, ArtifactSource};
use crate::result::{ArtifactCacheMode, CacheDeleteResult, CacheReadMode, CacheResult};
use crate::rule_key::RuleKey;
use crate::{Error, Result};
use async_trait::async_trait;
use filetime::FileTime;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use walkdir::WalkDir;

/// Upper bound on an entry header; anything larger is a corrupt entry
const MAX_HEADER_LEN: u32 = 1 << 20;

/// Artifact cache backed by a local directory.
#[derive(Debug)]
pub struct DirArtifactCache {
    name: String,
    layout: DirLayout,
    mode: CacheReadMode,
    max_size: Option<u64>,
    write_permits: Arc<Semaphore>,
    writers: TaskTracker,
    skipped: AtomicBool,
    closed: AtomicBool,
}

impl DirArtifactCache {
    /// Create a cache rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns error if the root cannot be created or `max_concurrent_writes`
    /// is zero
    pub fn new(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        mode: CacheReadMode,
        max_size: Option<u64>,
        max_concurrent_writes: usize,
    ) -> Result<Self> {
        if max_concurrent_writes == 0 {
            return Err(Error::configuration(
                "dir cache max_concurrent_writes must be greater than zero",
            ));
        }
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::io(e, &root, "create_dir_all"))?;
        Ok(Self {
            name: name.into(),
            layout: DirLayout { root },
            mode,
            max_size,
            write_permits: Arc::new(Semaphore::new(max_concurrent_writes)),
            writers: TaskTracker::new(),
            skipped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Create a cache from a `[[cache.dir]]` entry.
    ///
    /// # Errors
    ///
    /// Returns error if the root cannot be created
    pub fn from_entry(entry: &DirCacheEntry) -> Result<Self> {
        Self::new(
            entry.name.clone().unwrap_or_else(|| "dir".to_string()),
            entry.path.clone(),
            entry.mode,
            entry.max_size.map(|s| s.bytes()),
            entry.max_concurrent_writes,
        )
    }

    /// Cache root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.layout.root
    }

    /// Path of the entry stored under `key`
    #[must_use]
    pub fn payload_path(&self, key: &RuleKey) -> PathBuf {
        self.layout.payload_path(key)
    }

    /// Keys with an entry on disk.
    ///
    /// # Errors
    ///
    /// Returns error if the directory walk fails
    pub fn list_keys(&self) -> Result<Vec<RuleKey>> {
        Ok(self
            .layout
            .payloads()?
            .into_iter()
            .map(|entry| entry.key)
            .collect())
    }

    /// Total bytes of all entries on disk, headers included.
    ///
    /// # Errors
    ///
    /// Returns error if the directory walk fails
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.layout.payloads()?.iter().map(|e| e.size).sum())
    }

    async fn run_write<T, F>(&self, operation: &'static str, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&DirLayout) -> Result<T> + Send + 'static,
    {
        let permit = Arc::clone(&self.write_permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::backend(&self.name, "write pool is shut down"))?;
        let layout = self.layout.clone();
        let handle = self.writers.spawn_blocking(move || {
            let _permit = permit;
            work(&layout)
        });
        handle.await.map_err(|e| Error::task(operation, &e))?
    }
}

#[async_trait]
impl ArtifactCache for DirArtifactCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, _target: Option<&str>, key: &RuleKey, output: &Path) -> CacheResult {
        if self.skipped.load(Ordering::Acquire) {
            return CacheResult::skipped();
        }
        let layout = self.layout.clone();
        let key_owned = key.clone();
        let output = output.to_path_buf();
        let outcome =
            tokio::task::spawn_blocking(move || layout.fetch_blocking(&key_owned, &output)).await;

        match outcome {
            Ok(Ok(Some((info, size)))) => CacheResult::hit(
                &self.name,
                ArtifactCacheMode::Dir,
                info.metadata().clone(),
                size,
            ),
            Ok(Ok(None)) => CacheResult::miss(),
            Ok(Err(e)) => CacheResult::error(&self.name, ArtifactCacheMode::Dir, e.to_string()),
            Err(e) => CacheResult::error(
                &self.name,
                ArtifactCacheMode::Dir,
                Error::task("fetch", &e).to_string(),
            ),
        }
    }

    async fn contains_many(&self, keys: &[RuleKey]) -> HashMap<RuleKey, CacheResult> {
        keys.iter()
            .map(|key| {
                let path = self.layout.payload_path(key);
                let result = match fs::metadata(&path) {
                    Ok(meta) if meta.is_file() => {
                        CacheResult::contains(&self.name, ArtifactCacheMode::Dir)
                    }
                    Ok(_) => CacheResult::miss(),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => CacheResult::miss(),
                    Err(e) => CacheResult::error(
                        &self.name,
                        ArtifactCacheMode::Dir,
                        Error::io(e, path, "metadata").to_string(),
                    ),
                };
                (key.clone(), result)
            })
            .collect()
    }

    async fn store(&self, info: &ArtifactInfo, source: &ArtifactSource) -> Result<()> {
        if !self.mode.is_writable() {
            tracing::debug!(cache = %self.name, "Ignoring store to readonly dir cache");
            return Ok(());
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::backend(&self.name, "cache is closed"));
        }
        let info = info.clone();
        let source = source.clone();
        let max_size = self.max_size;
        self.run_write("store", move |layout| {
            layout.store_blocking(&info, &source)?;
            if let Some(max_size) = max_size {
                layout.evict_to(max_size)?;
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, keys: &[RuleKey]) -> Result<CacheDeleteResult> {
        if !self.mode.is_writable() {
            return Ok(CacheDeleteResult::for_cache(&self.name, BTreeSet::new()));
        }
        let keys = keys.to_vec();
        let deleted = self
            .run_write("delete", move |layout| {
                let mut deleted = BTreeSet::new();
                for key in keys {
                    if remove_if_exists(&layout.payload_path(&key))? {
                        deleted.insert(key);
                    }
                }
                Ok(deleted)
            })
            .await?;
        Ok(CacheDeleteResult::for_cache(&self.name, deleted))
    }

    fn read_mode(&self) -> CacheReadMode {
        self.mode
    }

    fn skip_pending_and_future_fetches(&self) {
        self.skipped.store(true, Ordering::Release);
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.writers.close();
        self.writers.wait().await;
        tracing::debug!(cache = %self.name, "Dir cache closed");
        Ok(())
    }
}

/// Path arithmetic and blocking I/O for the on-disk layout.
#[derive(Debug, Clone)]
struct DirLayout {
    root: PathBuf,
}

struct PayloadEntry {
    key: RuleKey,
    path: PathBuf,
    size: u64,
    last_access: FileTime,
}

impl DirLayout {
    fn payload_path(&self, key: &RuleKey) -> PathBuf {
        let hex = key.to_hex();
        let mut path = self.root.clone();
        if hex.len() >= 4 {
            path.push(&hex[0..2]);
            path.push(&hex[2..4]);
        }
        path.join(hex)
    }

    /// Returns `None` for a miss. Only a missing entry is a miss; any other
    /// I/O failure is an error.
    fn fetch_blocking(&self, key: &RuleKey, output: &Path) -> Result<Option<(ArtifactInfo, u64)>> {
        let path = self.payload_path(key);
        let mut entry = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(e, path, "open")),
        };
        let info = read_header(&mut entry, &path)?;
        let mut tmp = temp_file_beside(output)?;
        let size = io::copy(&mut entry, tmp.as_file_mut()).map_err(|e| Error::io(e, &path, "copy"))?;
        persist(tmp, output)?;
        if let Err(e) = filetime::set_file_atime(&path, FileTime::now()) {
            tracing::debug!(path = %path.display(), error = %e, "Failed to bump access time");
        }
        Ok(Some((info, size)))
    }

    fn store_blocking(&self, info: &ArtifactInfo, source: &ArtifactSource) -> Result<()> {
        let header = serde_json::to_vec(info)
            .map_err(|e| Error::serialization(format!("Failed to encode metadata: {e}")))?;
        // Every key is written from the source itself; copying a sibling entry
        // could pick up a concurrent store to that sibling.
        for key in info.rule_keys() {
            let dest = self.payload_path(key);
            write_entry(&dest, &header, source.path())?;
            tracing::trace!(rule_key = %key, path = %dest.display(), "Stored artifact");
        }
        if source.is_movable() {
            if let Err(e) = remove_if_exists(source.path()) {
                tracing::debug!(path = %source.path().display(), error = %e, "Failed to remove moved source");
            }
        }
        Ok(())
    }

    fn payloads(&self) -> Result<Vec<PayloadEntry>> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.map_err(|e| {
                Error::io(
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("directory loop")),
                    &self.root,
                    "walk",
                )
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str() else {
                continue;
            };
            // Temp files start with a dot
            if file_name.contains('.') {
                continue;
            }
            let Ok(key) = RuleKey::from_hex(file_name) else {
                continue;
            };
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let last_access = FileTime::from_last_access_time(&meta)
                .max(FileTime::from_last_modification_time(&meta));
            entries.push(PayloadEntry {
                key,
                path: entry.into_path(),
                size: meta.len(),
                last_access,
            });
        }
        Ok(entries)
    }

    /// Remove least recently used entries until the cache fits `max_size`.
    fn evict_to(&self, max_size: u64) -> Result<()> {
        let mut entries = self.payloads()?;
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        if total <= max_size {
            return Ok(());
        }
        entries.sort_by_key(|e| e.last_access);
        let mut evicted = 0usize;
        for entry in entries {
            if total <= max_size {
                break;
            }
            remove_if_exists(&entry.path)?;
            total = total.saturating_sub(entry.size);
            evicted += 1;
        }
        tracing::debug!(evicted, remaining_bytes = total, "Evicted dir cache entries");
        Ok(())
    }
}

/// Write header and the contents of `payload` to `dest` as one entry.
fn write_entry(dest: &Path, header: &[u8], payload: &Path) -> Result<u64> {
    let len = u32::try_from(header.len())
        .ok()
        .filter(|len| *len <= MAX_HEADER_LEN)
        .ok_or_else(|| Error::serialization("Artifact metadata is too large"))?;
    let mut input = fs::File::open(payload).map_err(|e| Error::io(e, payload, "open"))?;
    let mut tmp = temp_file_beside(dest)?;
    tmp.write_all(&len.to_be_bytes())
        .and_then(|()| tmp.write_all(header))
        .map_err(|e| Error::io(e, dest, "write"))?;
    let copied =
        io::copy(&mut input, tmp.as_file_mut()).map_err(|e| Error::io(e, payload, "copy"))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::io(e, dest, "sync"))?;
    persist(tmp, dest)?;
    Ok(copied)
}

/// Read the header of an entry, leaving `entry` positioned at the payload.
fn read_header(entry: &mut fs::File, path: &Path) -> Result<ArtifactInfo> {
    let mut len = [0u8; 4];
    entry
        .read_exact(&mut len)
        .map_err(|e| Error::io(e, path, "read"))?;
    let len = u32::from_be_bytes(len);
    if len > MAX_HEADER_LEN {
        return Err(Error::serialization(format!(
            "Corrupt entry {}: header of {len} bytes",
            path.display()
        )));
    }
    let mut header = vec![0u8; len as usize];
    entry
        .read_exact(&mut header)
        .map_err(|e| Error::io(e, path, "read"))?;
    serde_json::from_slice(&header)
        .map_err(|e| Error::serialization(format!("Corrupt entry {}: {e}", path.display())))
}
