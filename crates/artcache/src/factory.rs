//! Composition of configured caches into one artifact cache

use artcache_core::config::{HttpCacheEntry, LoadBalancing, http_host};
use artcache_core::{
    ArtifactCache, ArtifactCacheConfig, ArtifactCacheMode, CacheType, ContentAddressedStorage,
    DirArtifactCache, DirContentStore, Error, HybridCasOptions, HybridCasSecondLevelCache,
    LoggingArtifactCacheDecorator, MultiArtifactCache, NoopArtifactCache, Result,
    RetryingCacheDecorator, SharedArtifactCache, SqliteArtifactCache,
    TwoLevelArtifactCacheDecorator, TwoLevelThresholds,
};
use artcache_events::{CacheEvent, EventCategory, SharedEventSink};
use artcache_remote::{
    ClientSideSlb, HttpClientOptions, HttpContentStore, LoadBalancedService, NetworkCache,
    NetworkCacheOptions, RemoteError, RetryConfig, RetryingHttpService, SharedHttpService,
    SingleUriService,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Longest time `close` waits for the caches it owns
const CLOSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Header naming the user on whose behalf requests are sent
pub const USER_HEADER: &str = "X-Artcache-User";

/// Header naming the machine requests are sent from
pub const HOST_HEADER: &str = "X-Artcache-Host";

/// Facts about the environment the caches are built for.
#[derive(Clone)]
pub struct CacheEnvironment {
    /// Where cache events go
    pub event_sink: SharedEventSink,
    /// SSID of the current Wi-Fi network, if any
    pub wifi_ssid: Option<String>,
    /// User reported to remote caches
    pub user: String,
    /// Host reported to remote caches
    pub host: String,
    /// Identifier of this build, used to pick CAS reads
    pub invocation_id: String,
}

impl CacheEnvironment {
    /// Environment read from the process: `USER`/`USERNAME`, `HOSTNAME`, and a
    /// fresh invocation id.
    #[must_use]
    pub fn from_process(event_sink: SharedEventSink) -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "<unknown>".to_string());
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "<unknown>".to_string());
        Self {
            event_sink,
            wifi_ssid: None,
            user,
            host,
            invocation_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Set the current Wi-Fi network
    #[must_use]
    pub fn with_wifi_ssid(mut self, ssid: impl Into<String>) -> Self {
        self.wifi_ssid = Some(ssid.into());
        self
    }
}

/// Builds artifact caches from configuration and owns what it builds.
///
/// Every instance is a two-level decorator over either a single backing cache
/// or a multi-cache of several. `close` tears all of them down.
pub struct ArtifactCaches {
    config: ArtifactCacheConfig,
    environment: CacheEnvironment,
    instances: Mutex<Vec<SharedArtifactCache>>,
}

impl ArtifactCaches {
    /// Factory for `config`.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration does not validate
    pub fn new(config: ArtifactCacheConfig, environment: CacheEnvironment) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            environment,
            instances: Mutex::new(Vec::new()),
        })
    }

    /// Cache over every configured backing store.
    ///
    /// # Errors
    ///
    /// Returns error if a configured cache cannot be constructed
    pub fn new_instance(&self) -> Result<SharedArtifactCache> {
        self.instance_excluding(&HashSet::new())
    }

    /// Cache over the remote backing stores only.
    ///
    /// # Errors
    ///
    /// Returns error if a configured cache cannot be constructed
    pub fn remote_only_instance(&self) -> Result<SharedArtifactCache> {
        self.instance_excluding(&HashSet::from([CacheType::Local]))
    }

    /// Cache over the local backing stores only.
    ///
    /// # Errors
    ///
    /// Returns error if a configured cache cannot be constructed
    pub fn local_only_instance(&self) -> Result<SharedArtifactCache> {
        self.instance_excluding(&HashSet::from([CacheType::Remote]))
    }

    /// Number of instances built so far
    pub fn instance_count(&self) -> usize {
        self.instances.lock().map(|i| i.len()).unwrap_or_default()
    }

    /// Close every instance this factory built, then announce shutdown.
    ///
    /// Failures are logged, not returned.
    pub async fn close(&self) {
        let instances: Vec<SharedArtifactCache> = self
            .instances
            .lock()
            .map(|mut i| std::mem::take(&mut *i))
            .unwrap_or_default();

        let closing = futures::future::join_all(instances.iter().map(|cache| async move {
            if let Err(e) = cache.close().await {
                warn!(cache = %cache.name(), error = %e, "Failed to close artifact cache");
            }
        }));
        if tokio::time::timeout(CLOSE_TIMEOUT, closing).await.is_err() {
            warn!(
                timeout_secs = CLOSE_TIMEOUT.as_secs(),
                "Timed out closing artifact caches"
            );
        }

        self.environment
            .event_sink
            .emit(CacheEvent::new(EventCategory::Shutdown));
    }

    fn instance_excluding(&self, excluded: &HashSet<CacheType>) -> Result<SharedArtifactCache> {
        let started = Instant::now();
        self.environment.event_sink.emit(CacheEvent::connect_started());

        let cache = self.build(excluded)?;
        if let Ok(mut instances) = self.instances.lock() {
            instances.push(cache.clone());
        }

        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.environment
            .event_sink
            .emit(CacheEvent::connect_finished(elapsed));
        Ok(cache)
    }

    fn build(&self, excluded: &HashSet<CacheType>) -> Result<SharedArtifactCache> {
        let cache_config = &self.config.cache;
        if cache_config.mode.is_empty() {
            return Ok(Arc::new(NoopArtifactCache::new()));
        }

        let mut caches: Vec<SharedArtifactCache> = Vec::new();
        let mut wifi_warned = false;
        for mode in &cache_config.mode {
            if excluded.contains(&mode.cache_type()) {
                continue;
            }
            match mode {
                ArtifactCacheMode::Dir => {
                    for entry in &cache_config.dir {
                        let dir = DirArtifactCache::from_entry(entry)?;
                        caches.push(self.logged(Arc::new(dir)));
                    }
                }
                ArtifactCacheMode::Sqlite => {
                    for entry in &cache_config.sqlite {
                        let sqlite = SqliteArtifactCache::from_entry(entry)?;
                        caches.push(self.logged(Arc::new(sqlite)));
                    }
                }
                ArtifactCacheMode::Http | ArtifactCacheMode::ThriftOverHttp => {
                    for entry in &cache_config.http {
                        if !self.wifi_usable(entry) {
                            if !wifi_warned {
                                self.warn_wifi_unusable();
                                wifi_warned = true;
                            }
                            continue;
                        }
                        let network = self.network_cache(entry, *mode)?;
                        let retrying =
                            RetryingCacheDecorator::new(network, cache_config.max_fetch_retries)?;
                        caches.push(self.logged(Arc::new(retrying)));
                    }
                }
            }
        }

        let combined: SharedArtifactCache = if caches.len() == 1 {
            caches.remove(0)
        } else {
            Arc::new(MultiArtifactCache::new(
                caches,
                cache_config.store_failure_policy,
            ))
        };
        debug!(cache = %combined.name(), "Built artifact cache");

        let second_level = HybridCasSecondLevelCache::new(
            combined.clone(),
            self.content_store()?,
            HybridCasOptions {
                write_to_cas: cache_config.cas_write_enabled,
                double_write: cache_config.cas_double_write,
                cas_read_percentage: cache_config.cas_read_percentage,
                cas_min_size: cache_config.cas_min_size.bytes(),
                invocation_id: self.environment.invocation_id.clone(),
            },
        )?;
        let thresholds = TwoLevelThresholds {
            enabled: cache_config.two_level_enabled,
            min_size: cache_config.two_level_min_size.bytes(),
            max_size: cache_config.two_level_max_size.map(|s| s.bytes()),
        };
        Ok(Arc::new(TwoLevelArtifactCacheDecorator::new(
            combined,
            Arc::new(second_level),
            thresholds,
        )))
    }

    fn logged(&self, cache: SharedArtifactCache) -> SharedArtifactCache {
        Arc::new(LoggingArtifactCacheDecorator::new(
            cache,
            self.environment.event_sink.clone(),
        ))
    }

    fn wifi_usable(&self, entry: &HttpCacheEntry) -> bool {
        self.environment
            .wifi_ssid
            .as_ref()
            .is_none_or(|ssid| !entry.blacklisted_wifi_ssids.contains(ssid))
    }

    fn warn_wifi_unusable(&self) {
        let ssid = self.environment.wifi_ssid.as_deref().unwrap_or_default();
        warn!(ssid, "HTTP cache is disabled because WiFi is not usable");
        self.environment.event_sink.emit(CacheEvent::warning(format!(
            "Remote cache is disabled because the WiFi ({ssid}) is not usable."
        )));
    }

    fn identity_headers(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (USER_HEADER.to_string(), strip_non_ascii(&self.environment.user)),
            (HOST_HEADER.to_string(), strip_non_ascii(&self.environment.host)),
        ])
    }

    fn network_cache(
        &self,
        entry: &HttpCacheEntry,
        mode: ArtifactCacheMode,
    ) -> Result<SharedArtifactCache> {
        let cache_config = &self.config.cache;
        let name = entry
            .name
            .clone()
            .unwrap_or_else(|| mode.as_str().to_string());
        let remote_err = |e: RemoteError| e.into_cache_error(&name);

        let timeout = Duration::from_secs(entry.timeout_seconds);
        let connect_timeout =
            Duration::from_secs(entry.connect_timeout_seconds.unwrap_or(entry.timeout_seconds));
        let fetch_options = HttpClientOptions {
            timeout,
            connect_timeout: Some(connect_timeout),
            read_timeout: Some(Duration::from_secs(
                entry.read_timeout_seconds.unwrap_or(entry.timeout_seconds),
            )),
            max_idle_per_host: cache_config.http_thread_pool_size,
            default_headers: self.identity_headers(),
        };
        let store_options = HttpClientOptions {
            timeout: Duration::from_secs(
                entry.write_timeout_seconds.unwrap_or(entry.timeout_seconds),
            ),
            read_timeout: None,
            ..fetch_options.clone()
        };

        let (fetch_service, store_service, host): (SharedHttpService, SharedHttpService, String) =
            match cache_config.load_balancing {
                LoadBalancing::SingleServer => {
                    let host = http_host(&entry.url).unwrap_or_default().to_string();
                    let fetch = SingleUriService::new(&entry.url, fetch_options).map_err(remote_err)?;
                    let store = SingleUriService::new(&entry.url, store_options).map_err(remote_err)?;
                    (Arc::new(fetch), Arc::new(store), host)
                }
                LoadBalancing::ClientSlb => {
                    let slb_config = self.config.slb.as_ref().ok_or_else(|| {
                        Error::configuration("load_balancing = \"client_slb\" requires [slb] servers")
                    })?;
                    let slb = Arc::new(ClientSideSlb::from_config(slb_config).map_err(remote_err)?);
                    let fetch = LoadBalancedService::new(slb.clone(), &fetch_options).map_err(remote_err)?;
                    let store = LoadBalancedService::new(slb, &store_options).map_err(remote_err)?;
                    let fetch_retry = RetryConfig {
                        max_attempts: cache_config.max_fetch_retries.saturating_add(1),
                        ..RetryConfig::default()
                    };
                    let store_retry = RetryConfig::fixed(
                        cache_config.max_store_attempts,
                        cache_config.store_retry_interval_ms,
                    );
                    (
                        Arc::new(RetryingHttpService::new(Arc::new(fetch), fetch_retry, "fetch")),
                        Arc::new(RetryingHttpService::new(Arc::new(store), store_retry, "store")),
                        "client_slb".to_string(),
                    )
                }
            };

        let options = NetworkCacheOptions {
            name: name.clone(),
            cache_mode: mode,
            read_mode: entry.mode,
            host,
            read_headers: entry.read_headers.clone(),
            write_headers: entry.write_headers.clone(),
            error_message_format: entry.error_message_format.clone(),
            error_message_limit: entry.error_message_limit,
            batch_endpoint: match mode {
                ArtifactCacheMode::ThriftOverHttp => cache_config.batch_endpoint.clone(),
                _ => None,
            },
            multi_fetch_limit: cache_config.multi_fetch_limit,
            multi_check: cache_config.multi_check,
            max_concurrent_writes: cache_config.http_max_concurrent_writes,
            event_sink: self.environment.event_sink.clone(),
        };
        info!(cache = %name, mode = mode.as_str(), "Configured network cache");
        let cache = NetworkCache::new(options, fetch_service, store_service).map_err(remote_err)?;
        Ok(Arc::new(cache))
    }

    fn content_store(&self) -> Result<Option<Arc<dyn ContentAddressedStorage>>> {
        let cache_config = &self.config.cache;
        if let Some(url) = &cache_config.cas_url {
            let options = HttpClientOptions {
                default_headers: self.identity_headers(),
                ..HttpClientOptions::default()
            };
            let service = SingleUriService::new(url, options).map_err(|e| e.into_cache_error("cas"))?;
            return Ok(Some(Arc::new(HttpContentStore::new("cas", Arc::new(service)))));
        }
        Ok(cache_config
            .cas_dir
            .as_ref()
            .map(|dir| Arc::new(DirContentStore::new(dir.clone())) as Arc<dyn ContentAddressedStorage>))
    }
}

fn strip_non_ascii(value: &str) -> String {
    value.chars().filter(char::is_ascii).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_non_ascii() {
        assert_eq!(strip_non_ascii("jörg"), "jrg");
        assert_eq!(strip_non_ascii("build-01"), "build-01");
    }

    #[test]
    fn test_environment_has_fresh_invocation_id() {
        let a = CacheEnvironment::from_process(artcache_events::noop_sink());
        let b = CacheEnvironment::from_process(artcache_events::noop_sink());
        assert_ne!(a.invocation_id, b.invocation_id);
        assert!(a.wifi_ssid.is_none());
        assert_eq!(a.with_wifi_ssid("office").wifi_ssid.as_deref(), Some("office"));
    }
}
