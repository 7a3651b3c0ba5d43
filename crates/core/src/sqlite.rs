//! SQLite-backed local cache
//!
//! Payloads are stored inline in a single table. The database runs in WAL
//! mode so readers never block on a writer.

use crate::cache::ArtifactCache;
use crate::config::SqliteCacheEntry;
use crate::fs::{temp_file_beside, persist};
use crate::info::{ArtifactInfo, ArtifactSource};
use crate::result::{ArtifactCacheMode, CacheDeleteResult, CacheReadMode, CacheResult};
use crate::rule_key::RuleKey;
use crate::{Error, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS artifacts (
    rule_key TEXT PRIMARY KEY,
    metadata TEXT NOT NULL,
    content BLOB NOT NULL,
    created_at INTEGER NOT NULL
)";

/// Artifact cache stored in a SQLite database.
#[derive(Debug)]
pub struct SqliteArtifactCache {
    name: String,
    conn: Arc<Mutex<Connection>>,
    mode: CacheReadMode,
    max_inlined_bytes: u64,
    skipped: AtomicBool,
}

impl SqliteArtifactCache {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened or migrated
    pub fn open(
        name: impl Into<String>,
        path: &Path,
        mode: CacheReadMode,
        max_inlined_bytes: u64,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
        }
        let conn = Connection::open(path).map_err(|e| Error::sqlite(e, "open"))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
            .map_err(|e| Error::sqlite(e, "enable WAL"))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::sqlite(e, "create schema"))?;
        Ok(Self {
            name: name.into(),
            conn: Arc::new(Mutex::new(conn)),
            mode,
            max_inlined_bytes,
            skipped: AtomicBool::new(false),
        })
    }

    /// Open the database described by a `[[cache.sqlite]]` entry.
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened
    pub fn from_entry(entry: &SqliteCacheEntry) -> Result<Self> {
        Self::open(
            entry.name.clone().unwrap_or_else(|| "sqlite".to_string()),
            &entry.path,
            entry.mode,
            entry.max_inlined_bytes.bytes(),
        )
    }

    async fn with_conn<T, F>(&self, operation: &'static str, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| Error::backend(name, "connection mutex poisoned"))?;
            work(&guard)
        })
        .await
        .map_err(|e| Error::task(operation, &e))?
    }
}

struct Row {
    metadata: String,
    content: Vec<u8>,
}

#[async_trait]
impl ArtifactCache for SqliteArtifactCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, _target: Option<&str>, key: &RuleKey, output: &Path) -> CacheResult {
        if self.skipped.load(Ordering::Acquire) {
            return CacheResult::skipped();
        }
        let hex = key.to_hex();
        let output: PathBuf = output.to_path_buf();
        let outcome = self
            .with_conn("fetch", move |conn| {
                let row = conn
                    .query_row(
                        "SELECT metadata, content FROM artifacts WHERE rule_key = ?1",
                        params![hex],
                        |row| {
                            Ok(Row {
                                metadata: row.get(0)?,
                                content: row.get(1)?,
                            })
                        },
                    )
                    .optional()
                    .map_err(|e| Error::sqlite(e, "select artifact"))?;
                let Some(row) = row else {
                    return Ok(None);
                };
                let info: ArtifactInfo = serde_json::from_str(&row.metadata)
                    .map_err(|e| Error::serialization(format!("Corrupt metadata row: {e}")))?;
                let mut tmp = temp_file_beside(&output)?;
                tmp.write_all(&row.content)
                    .map_err(|e| Error::io(e, tmp.path(), "write"))?;
                persist(tmp, &output)?;
                Ok(Some((info.metadata().clone(), row.content.len() as u64)))
            })
            .await;

        match outcome {
            Ok(Some((metadata, size))) => {
                CacheResult::hit(&self.name, ArtifactCacheMode::Sqlite, metadata, size)
            }
            Ok(None) => CacheResult::miss(),
            Err(e) => CacheResult::error(&self.name, ArtifactCacheMode::Sqlite, e.to_string()),
        }
    }

    async fn contains_many(&self, keys: &[RuleKey]) -> HashMap<RuleKey, CacheResult> {
        let keys_owned = keys.to_vec();
        let present = self
            .with_conn("contains", move |conn| {
                let mut stmt = conn
                    .prepare("SELECT 1 FROM artifacts WHERE rule_key = ?1")
                    .map_err(|e| Error::sqlite(e, "prepare contains"))?;
                let mut present = BTreeSet::new();
                for key in keys_owned {
                    let exists = stmt
                        .exists(params![key.to_hex()])
                        .map_err(|e| Error::sqlite(e, "contains"))?;
                    if exists {
                        present.insert(key);
                    }
                }
                Ok(present)
            })
            .await;

        keys.iter()
            .map(|key| {
                let result = match &present {
                    Ok(present) if present.contains(key) => {
                        CacheResult::contains(&self.name, ArtifactCacheMode::Sqlite)
                    }
                    Ok(_) => CacheResult::miss(),
                    Err(e) => {
                        CacheResult::error(&self.name, ArtifactCacheMode::Sqlite, e.to_string())
                    }
                };
                (key.clone(), result)
            })
            .collect()
    }

    async fn store(&self, info: &ArtifactInfo, source: &ArtifactSource) -> Result<()> {
        if !self.mode.is_writable() {
            tracing::debug!(cache = %self.name, "Ignoring store to readonly sqlite cache");
            return Ok(());
        }
        let size = tokio::fs::metadata(source.path())
            .await
            .map_err(|e| Error::io(e, source.path(), "metadata"))?
            .len();
        if size > self.max_inlined_bytes {
            return Err(Error::backend(
                &self.name,
                format!(
                    "artifact of {size} bytes exceeds max_inlined_bytes ({})",
                    self.max_inlined_bytes
                ),
            ));
        }
        let content = tokio::fs::read(source.path())
            .await
            .map_err(|e| Error::io(e, source.path(), "read"))?;
        let metadata = serde_json::to_string(info)
            .map_err(|e| Error::serialization(format!("Failed to encode metadata: {e}")))?;
        let keys: Vec<String> = info.rule_keys().iter().map(RuleKey::to_hex).collect();
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
            .unwrap_or_default();

        self.with_conn("store", move |conn| {
            for key in &keys {
                conn.execute(
                    "INSERT OR REPLACE INTO artifacts (rule_key, metadata, content, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![key, metadata, content, created_at],
                )
                .map_err(|e| Error::sqlite(e, "insert artifact"))?;
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
            .with_conn("delete", move |conn| {
                let mut deleted = BTreeSet::new();
                for key in keys {
                    let removed = conn
                        .execute(
                            "DELETE FROM artifacts WHERE rule_key = ?1",
                            params![key.to_hex()],
                        )
                        .map_err(|e| Error::sqlite(e, "delete artifact"))?;
                    if removed > 0 {
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
        // Checkpoint so the WAL does not outlive the build
        self.with_conn("close", |conn| {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
                .map_err(|e| Error::sqlite(e, "checkpoint"))
        })
        .await
    }
}
