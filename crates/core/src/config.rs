//! Cache configuration
//!
//! Configuration is read from TOML once, validated, and then consumed by the
//! cache factory. Validation fails fast: a misconfigured cache aborts
//! construction rather than silently disabling caching.

use crate::result::{ArtifactCacheMode, CacheReadMode};
use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default error template for remote caches.
pub const DEFAULT_ERROR_MESSAGE_FORMAT: &str =
    "The {cache_name} cache encountered an error. {error_message}";

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ArtifactCacheConfig {
    /// The `[cache]` table
    #[serde(default)]
    pub cache: CacheConfig,

    /// The `[slb]` table, used with `load_balancing = "client_slb"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slb: Option<SlbConfig>,
}

impl ArtifactCacheConfig {
    /// Parse and validate a TOML document.
    ///
    /// Paths with a leading `~` are expanded to the home directory.
    ///
    /// # Errors
    ///
    /// Returns error if the document does not parse or fails validation
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(source)
            .map_err(|e| Error::configuration(format!("Invalid cache configuration: {e}")))?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or the configuration is invalid
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| Error::io(e, path, "read"))?;
        Self::from_toml_str(&source)
    }

    fn expand_paths(&mut self) {
        for entry in &mut self.cache.dir {
            entry.path = expand_tilde(&entry.path);
        }
        for entry in &mut self.cache.sqlite {
            entry.path = expand_tilde(&entry.path);
        }
        if let Some(cas_dir) = &self.cache.cas_dir {
            self.cache.cas_dir = Some(expand_tilde(cas_dir));
        }
    }

    /// Check construction preconditions.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first violated rule
    pub fn validate(&self) -> Result<()> {
        let cache = &self.cache;
        if cache.max_fetch_retries == 0 {
            return Err(Error::configuration(
                "max_fetch_retries must be greater than zero",
            ));
        }
        if cache.max_store_attempts == 0 {
            return Err(Error::configuration(
                "max_store_attempts must be greater than zero",
            ));
        }
        if cache.http_max_concurrent_writes == 0 {
            return Err(Error::configuration(
                "http_max_concurrent_writes must be greater than zero",
            ));
        }
        if cache.multi_fetch_limit == 0 {
            return Err(Error::configuration(
                "multi_fetch_limit must be greater than zero",
            ));
        }
        if cache.cas_read_percentage > 100 {
            return Err(Error::configuration(format!(
                "cas_read_percentage must be between 0 and 100, got {}",
                cache.cas_read_percentage
            )));
        }
        if let Some(max) = cache.two_level_max_size {
            if cache.two_level_min_size > max {
                return Err(Error::configuration(format!(
                    "two_level_min_size ({}) exceeds two_level_max_size ({max})",
                    cache.two_level_min_size
                )));
            }
        }

        let uses_http = cache
            .mode
            .iter()
            .any(|m| matches!(m, ArtifactCacheMode::Http | ArtifactCacheMode::ThriftOverHttp));
        if uses_http {
            if cache.load_balancing == LoadBalancing::SingleServer {
                for entry in &cache.http {
                    http_host(&entry.url).ok_or_else(|| {
                        Error::configuration(format!(
                            "http cache url '{}' is not a valid http(s) URL",
                            entry.url
                        ))
                    })?;
                }
            } else {
                let servers = self.slb.as_ref().map(|s| s.servers.as_slice()).unwrap_or(&[]);
                if servers.is_empty() {
                    return Err(Error::configuration(
                        "load_balancing = \"client_slb\" requires [slb] servers",
                    ));
                }
                for server in servers {
                    http_host(server).ok_or_else(|| {
                        Error::configuration(format!(
                            "slb server '{server}' is not a valid http(s) URL"
                        ))
                    })?;
                }
            }
        }
        if cache.mode.contains(&ArtifactCacheMode::ThriftOverHttp)
            && cache.batch_endpoint.as_deref().is_none_or(str::is_empty)
        {
            return Err(Error::configuration(
                "mode thrift_over_http requires batch_endpoint",
            ));
        }
        if let Some(cas_url) = &cache.cas_url {
            http_host(cas_url).ok_or_else(|| {
                Error::configuration(format!("cas_url '{cas_url}' is not a valid http(s) URL"))
            })?;
        }
        Ok(())
    }
}

/// The `[cache]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Enabled cache kinds. Empty disables caching.
    #[serde(default)]
    pub mode: Vec<ArtifactCacheMode>,

    /// Fetch attempts per network cache
    #[serde(default = "default_max_fetch_retries")]
    pub max_fetch_retries: u32,

    /// Store attempts per network cache
    #[serde(default = "default_max_store_attempts")]
    pub max_store_attempts: u32,

    /// Delay between store attempts in milliseconds
    #[serde(default = "default_store_retry_interval_ms")]
    pub store_retry_interval_ms: u64,

    /// Concurrent uploads per network cache
    #[serde(default = "default_http_max_concurrent_writes")]
    pub http_max_concurrent_writes: usize,

    /// Connection pool size per network cache
    #[serde(default = "default_http_thread_pool_size")]
    pub http_thread_pool_size: usize,

    /// How remote servers are chosen
    #[serde(default)]
    pub load_balancing: LoadBalancing,

    /// Path of the batch endpoint used by `thrift_over_http`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_endpoint: Option<String>,

    /// Maximum keys per batch fetch request
    #[serde(default = "default_multi_fetch_limit")]
    pub multi_fetch_limit: usize,

    /// Use the batch contains endpoint
    #[serde(default)]
    pub multi_check: bool,

    /// Write large artifacts through the second level
    #[serde(default)]
    pub two_level_enabled: bool,

    /// Smallest artifact routed through the second level
    #[serde(default = "default_two_level_min_size")]
    pub two_level_min_size: ByteSize,

    /// Largest artifact routed through the second level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub two_level_max_size: Option<ByteSize>,

    /// What to do when a fan-out store fails
    #[serde(default)]
    pub store_failure_policy: StoreFailurePolicy,

    /// Remote content-addressed store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cas_url: Option<String>,

    /// Local content-addressed store, used when no `cas_url` is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cas_dir: Option<PathBuf>,

    /// Write second-level blobs to the CAS
    #[serde(default)]
    pub cas_write_enabled: bool,

    /// Also keep a primary-cache copy of CAS blobs
    #[serde(default)]
    pub cas_double_write: bool,

    /// Percentage of second-level reads tried against the CAS first
    #[serde(default)]
    pub cas_read_percentage: u8,

    /// Smallest blob written to the CAS
    #[serde(default)]
    pub cas_min_size: ByteSize,

    /// `[[cache.dir]]` entries
    #[serde(default)]
    pub dir: Vec<DirCacheEntry>,

    /// `[[cache.http]]` entries
    #[serde(default)]
    pub http: Vec<HttpCacheEntry>,

    /// `[[cache.sqlite]]` entries
    #[serde(default)]
    pub sqlite: Vec<SqliteCacheEntry>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: Vec::new(),
            max_fetch_retries: default_max_fetch_retries(),
            max_store_attempts: default_max_store_attempts(),
            store_retry_interval_ms: default_store_retry_interval_ms(),
            http_max_concurrent_writes: default_http_max_concurrent_writes(),
            http_thread_pool_size: default_http_thread_pool_size(),
            load_balancing: LoadBalancing::default(),
            batch_endpoint: None,
            multi_fetch_limit: default_multi_fetch_limit(),
            multi_check: false,
            two_level_enabled: false,
            two_level_min_size: default_two_level_min_size(),
            two_level_max_size: None,
            store_failure_policy: StoreFailurePolicy::default(),
            cas_url: None,
            cas_dir: None,
            cas_write_enabled: false,
            cas_double_write: false,
            cas_read_percentage: 0,
            cas_min_size: ByteSize::default(),
            dir: Vec::new(),
            http: Vec::new(),
            sqlite: Vec::new(),
        }
    }
}

/// Remote server selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    /// One URL per http entry
    #[default]
    SingleServer,
    /// Round robin over `[slb] servers` with health tracking
    ClientSlb,
}

/// Policy for failed stores in a multi-cache fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreFailurePolicy {
    /// Log the failure and report success
    #[default]
    #[serde(rename = "log")]
    LogAndIgnore,
    /// Return an aggregated error after every store finished
    #[serde(rename = "propagate")]
    Propagate,
}

/// A `[[cache.dir]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirCacheEntry {
    /// Optional name; defaults to `dir`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Cache root directory
    #[serde(default = "default_dir_cache_path")]
    pub path: PathBuf,

    /// Read mode
    #[serde(default)]
    pub mode: CacheReadMode,

    /// Evict least recently used artifacts above this size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<ByteSize>,

    /// Concurrent background writes
    #[serde(default = "default_dir_max_concurrent_writes")]
    pub max_concurrent_writes: usize,
}

impl DirCacheEntry {
    /// Entry for `path` with defaults everywhere else
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            name: None,
            path: path.into(),
            mode: CacheReadMode::ReadWrite,
            max_size: None,
            max_concurrent_writes: default_dir_max_concurrent_writes(),
        }
    }
}

/// A `[[cache.http]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpCacheEntry {
    /// Optional name; defaults to the mode name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Base URL of the cache server
    #[serde(default)]
    pub url: String,

    /// Read mode
    #[serde(default)]
    pub mode: CacheReadMode,

    /// Whole-request timeout in seconds
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Connect timeout in seconds; defaults to `timeout_seconds`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_seconds: Option<u64>,

    /// Fetch timeout in seconds; defaults to `timeout_seconds`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_timeout_seconds: Option<u64>,

    /// Store timeout in seconds; defaults to `timeout_seconds`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_timeout_seconds: Option<u64>,

    /// Headers added to fetch requests
    #[serde(default)]
    pub read_headers: BTreeMap<String, String>,

    /// Headers added to store and delete requests
    #[serde(default)]
    pub write_headers: BTreeMap<String, String>,

    /// Template for fetch error text
    #[serde(default = "default_error_message_format")]
    pub error_message_format: String,

    /// Maximum characters of the underlying error kept in fetch error text
    #[serde(default = "default_error_message_limit")]
    pub error_message_limit: usize,

    /// Wi-Fi networks on which this cache is disabled
    #[serde(default)]
    pub blacklisted_wifi_ssids: Vec<String>,
}

impl HttpCacheEntry {
    /// Entry for `url` with defaults everywhere else
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            name: None,
            url: url.into(),
            mode: CacheReadMode::ReadWrite,
            timeout_seconds: default_timeout_seconds(),
            connect_timeout_seconds: None,
            read_timeout_seconds: None,
            write_timeout_seconds: None,
            read_headers: BTreeMap::new(),
            write_headers: BTreeMap::new(),
            error_message_format: default_error_message_format(),
            error_message_limit: default_error_message_limit(),
            blacklisted_wifi_ssids: Vec::new(),
        }
    }
}

/// A `[[cache.sqlite]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SqliteCacheEntry {
    /// Optional name; defaults to `sqlite`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Database file
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,

    /// Read mode
    #[serde(default)]
    pub mode: CacheReadMode,

    /// Largest payload stored in the database
    #[serde(default = "default_max_inlined_bytes")]
    pub max_inlined_bytes: ByteSize,
}

/// The `[slb]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlbConfig {
    /// Candidate servers
    #[serde(default)]
    pub servers: Vec<String>,

    /// Consecutive errors before a server is taken out of rotation
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,

    /// How long an unhealthy server stays out of rotation
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

/// A byte count written with an optional `B`/`KB`/`MB`/`GB`/`TB` suffix.
///
/// Suffixes are case-insensitive and 1024-based.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(pub u64);

impl ByteSize {
    /// Size in bytes
    #[must_use]
    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, suffix) = trimmed.split_at(split);
        let value: u64 = digits
            .parse()
            .map_err(|_| Error::configuration(format!("Invalid size '{s}'")))?;
        let multiplier: u64 = match suffix.trim().to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "KB" => 1 << 10,
            "MB" => 1 << 20,
            "GB" => 1 << 30,
            "TB" => 1 << 40,
            other => {
                return Err(Error::configuration(format!(
                    "Invalid size suffix '{other}' in '{s}'"
                )));
            }
        };
        value
            .checked_mul(multiplier)
            .map(Self)
            .ok_or_else(|| Error::configuration(format!("Size '{s}' is too large")))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.0)
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Self(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Expand a leading `~` to the home directory.
#[must_use]
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// Default root for local caches: `$XDG_CACHE_HOME/artcache` or equivalent.
#[must_use]
pub fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("artcache")
}

/// Host part of an `http://` or `https://` URL
#[must_use]
pub fn http_host(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))?;
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = authority.rsplit('@').next().unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default();
    (!host.is_empty()).then_some(host)
}

// Default value functions
fn default_max_fetch_retries() -> u32 {
    2
}

fn default_max_store_attempts() -> u32 {
    1
}

fn default_store_retry_interval_ms() -> u64 {
    1000
}

fn default_http_max_concurrent_writes() -> usize {
    1
}

fn default_http_thread_pool_size() -> usize {
    200
}

fn default_multi_fetch_limit() -> usize {
    100
}

fn default_two_level_min_size() -> ByteSize {
    ByteSize(1 << 10)
}

fn default_dir_cache_path() -> PathBuf {
    default_cache_root().join("dir")
}

fn default_dir_max_concurrent_writes() -> usize {
    4
}

fn default_sqlite_path() -> PathBuf {
    default_cache_root().join("artifacts.db")
}

fn default_max_inlined_bytes() -> ByteSize {
    ByteSize(40 << 20)
}

fn default_timeout_seconds() -> u64 {
    3
}

fn default_error_message_format() -> String {
    DEFAULT_ERROR_MESSAGE_FORMAT.to_string()
}

fn default_error_message_limit() -> usize {
    100
}

fn default_error_threshold() -> u32 {
    3
}

fn default_cooldown_ms() -> u64 {
    30_000
}
