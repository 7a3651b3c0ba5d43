//! Artifact cache backed by a remote HTTP server

use crate::error::{RemoteError, Result};
use crate::protocol::{
    self, BatchDeleteResponse, BatchKeysRequest, BatchResponse, BatchResult, BatchStatus,
    FrameDecoder, FrameHeader, STORE_PATH,
};
use crate::transport::{HttpRequest, RequestBody, SharedHttpService};
use artcache_core::config::DEFAULT_ERROR_MESSAGE_FORMAT;
use artcache_core::{
    ArtifactCache, ArtifactCacheMode, ArtifactInfo, ArtifactSource, CacheDeleteResult,
    CacheReadMode, CacheResult, RuleKey,
};
use artcache_events::{CacheEvent, EventCategory, SharedEventSink, noop_sink};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Everything a [`NetworkCache`] needs besides its transports
#[derive(Clone)]
pub struct NetworkCacheOptions {
    /// Name used in logs, events and results
    pub name: String,
    /// `Http` or `ThriftOverHttp`
    pub cache_mode: ArtifactCacheMode,
    /// Whether stores and deletes are sent
    pub read_mode: CacheReadMode,
    /// Host shown in error text
    pub host: String,
    /// Headers added to fetch and contains requests
    pub read_headers: BTreeMap<String, String>,
    /// Headers added to store and delete requests
    pub write_headers: BTreeMap<String, String>,
    /// Error text template with `{cache_name}`, `{host}` and `{error_message}`
    pub error_message_format: String,
    /// Maximum characters of the underlying error kept in error text
    pub error_message_limit: usize,
    /// Batch endpoint; enables batch fetch and delete
    pub batch_endpoint: Option<String>,
    /// Keys per batch fetch request
    pub multi_fetch_limit: usize,
    /// Use the batch contains endpoint
    pub multi_check: bool,
    /// Concurrent stores
    pub max_concurrent_writes: usize,
    /// Where `BytesReceived` events go
    pub event_sink: SharedEventSink,
}

impl NetworkCacheOptions {
    /// Options for a plain `http` cache with defaults everywhere else
    #[must_use]
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cache_mode: ArtifactCacheMode::Http,
            read_mode: CacheReadMode::ReadWrite,
            host: host.into(),
            read_headers: BTreeMap::new(),
            write_headers: BTreeMap::new(),
            error_message_format: DEFAULT_ERROR_MESSAGE_FORMAT.to_string(),
            error_message_limit: 100,
            batch_endpoint: None,
            multi_fetch_limit: 100,
            multi_check: false,
            max_concurrent_writes: 1,
            event_sink: noop_sink(),
        }
    }
}

/// Remote cache speaking the framed artifact protocol.
///
/// Fetches go through the fetch transport and stores and deletes through the
/// store transport, so each can carry its own retry policy. Stores are bounded
/// by a semaphore of `max_concurrent_writes` permits.
pub struct NetworkCache {
    options: NetworkCacheOptions,
    fetch_service: SharedHttpService,
    store_service: SharedHttpService,
    write_permits: Arc<Semaphore>,
    max_writes: u32,
    skip: CancellationToken,
    failure_reported: AtomicBool,
}

impl NetworkCache {
    /// Create a network cache.
    ///
    /// # Errors
    ///
    /// Returns error if `max_concurrent_writes` or `multi_fetch_limit` is zero,
    /// or if `cache_mode` is a local mode
    pub fn new(
        options: NetworkCacheOptions,
        fetch_service: SharedHttpService,
        store_service: SharedHttpService,
    ) -> Result<Self> {
        if !matches!(
            options.cache_mode,
            ArtifactCacheMode::Http | ArtifactCacheMode::ThriftOverHttp
        ) {
            return Err(RemoteError::Config(format!(
                "{} is not a network cache mode",
                options.cache_mode.as_str()
            )));
        }
        if options.multi_fetch_limit == 0 {
            return Err(RemoteError::Config(
                "multi_fetch_limit must be greater than zero".into(),
            ));
        }
        let max_writes = u32::try_from(options.max_concurrent_writes)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                RemoteError::Config("max_concurrent_writes must be between 1 and u32::MAX".into())
            })?;
        Ok(Self {
            write_permits: Arc::new(Semaphore::new(max_writes as usize)),
            max_writes,
            options,
            fetch_service,
            store_service,
            skip: CancellationToken::new(),
            failure_reported: AtomicBool::new(false),
        })
    }

    /// Error text for a failed fetch, rendered from the configured template
    #[must_use]
    pub fn format_error(&self, message: &str) -> String {
        let truncated: String = message.chars().take(self.options.error_message_limit).collect();
        self.options
            .error_message_format
            .replace("{cache_name}", &self.options.name)
            .replace("{host}", &self.options.host)
            .replace("{error_message}", &truncated)
    }

    /// Error result for `key`. The first failure of this cache is also
    /// surfaced to the user as a warning event.
    fn fetch_error(&self, key: &RuleKey, err: &RemoteError) -> CacheResult {
        debug!(cache = %self.options.name, rule_key = %key, error = %err, "Fetch failed");
        let message = self.format_error(&err.to_string());
        if !self.failure_reported.swap(true, Ordering::AcqRel) {
            warn!(cache = %self.options.name, error = %err, "Network cache is failing");
            self.options
                .event_sink
                .emit(CacheEvent::warning(message.clone()));
        }
        CacheResult::error(&self.options.name, self.options.cache_mode, message)
    }

    fn hit(&self, header: FrameHeader) -> CacheResult {
        CacheResult::hit(
            &self.options.name,
            self.options.cache_mode,
            header.metadata,
            header.payload_size,
        )
    }

    fn batch_endpoint(&self) -> Option<&str> {
        self.options
            .batch_endpoint
            .as_deref()
            .filter(|e| !e.trim_matches('/').is_empty())
    }

    async fn fetch_one(&self, key: &RuleKey, output: &Path) -> CacheResult {
        match self.try_fetch(key, output).await {
            Ok(Some(header)) => self.hit(header),
            Ok(None) => CacheResult::miss(),
            Err(err) => self.fetch_error(key, &err),
        }
    }

    async fn try_fetch(&self, key: &RuleKey, output: &Path) -> Result<Option<FrameHeader>> {
        let request = HttpRequest::get(protocol::artifact_path(key)).headers(&self.options.read_headers);
        let response = self.fetch_service.make_request(request).await?;
        match response.status() {
            404 => Ok(None),
            status if !(200..300).contains(&status) => {
                Err(RemoteError::status(status, response.url()))
            }
            _ => self
                .receive_frame(response.into_body(), key, output)
                .await
                .map(Some),
        }
    }

    /// Stream a frame into a temp file beside `output`, verify it and publish.
    ///
    /// Dropping the future part way removes the temp file.
    async fn receive_frame(
        &self,
        mut body: impl Stream<Item = Result<Bytes>> + Unpin + Send,
        key: &RuleKey,
        output: &Path,
    ) -> Result<FrameHeader> {
        let tmp = artcache_core::fs::temp_file_beside(output)
            .map_err(|e| RemoteError::protocol(format!("Cannot stage download: {e}")))?;
        let std_file = tmp
            .as_file()
            .try_clone()
            .map_err(|e| RemoteError::io(e, tmp.path(), "clone"))?;
        let mut file = tokio::fs::File::from_std(std_file);

        let mut decoder = FrameDecoder::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            self.options
                .event_sink
                .emit(CacheEvent::new(EventCategory::BytesReceived {
                    bytes: chunk.len() as u64,
                }));
            let payload = decoder.push(&chunk)?;
            if !payload.is_empty() {
                file.write_all(&payload)
                    .await
                    .map_err(|e| RemoteError::io(e, tmp.path(), "write"))?;
            }
        }
        file.flush()
            .await
            .map_err(|e| RemoteError::io(e, tmp.path(), "flush"))?;
        drop(file);

        let header = decoder.finish()?;
        if !header.rule_keys.contains(key) {
            return Err(RemoteError::protocol(format!(
                "Server returned an artifact that is not stored under {key}"
            )));
        }
        artcache_core::fs::persist(tmp, output)
            .map_err(|e| RemoteError::protocol(format!("Cannot publish download: {e}")))?;
        Ok(header)
    }

    async fn batch_fetch(
        &self,
        endpoint: &str,
        requests: &[(RuleKey, PathBuf)],
    ) -> Vec<CacheResult> {
        let mut results = Vec::with_capacity(requests.len());
        for chunk in requests.chunks(self.options.multi_fetch_limit) {
            if self.skip.is_cancelled() {
                results.extend(chunk.iter().map(|_| CacheResult::skipped()));
                continue;
            }
            let keys: Vec<RuleKey> = chunk.iter().map(|(key, _)| key.clone()).collect();
            let answered = tokio::select! {
                biased;
                () = self.skip.cancelled() => None,
                answered = self.post_batch(endpoint, "fetch", &keys) => Some(answered),
            };
            let Some(answered) = answered else {
                results.extend(chunk.iter().map(|_| CacheResult::skipped()));
                continue;
            };
            match answered {
                Ok(mut by_key) => {
                    for (key, output) in chunk {
                        let result = match by_key.remove(key) {
                            Some(entry) => self.resolve_batch_fetch(entry, key, output).await,
                            None => self.fetch_error(
                                key,
                                &RemoteError::protocol("Batch response has no result for this key"),
                            ),
                        };
                        results.push(result);
                    }
                }
                Err(err) => {
                    warn!(cache = %self.options.name, error = %err, "Batch fetch failed");
                    results.extend(chunk.iter().map(|(key, _)| self.fetch_error(key, &err)));
                }
            }
        }
        results
    }

    async fn resolve_batch_fetch(
        &self,
        entry: BatchResult,
        key: &RuleKey,
        output: &Path,
    ) -> CacheResult {
        match entry.status {
            BatchStatus::Miss => CacheResult::miss(),
            BatchStatus::Hit => {
                let frame = match entry.frame_bytes() {
                    Ok(frame) => frame,
                    Err(err) => return self.fetch_error(key, &err),
                };
                let body = futures::stream::iter([Ok(Bytes::from(frame))]);
                match self.receive_frame(body, key, output).await {
                    Ok(header) => self.hit(header),
                    Err(err) => self.fetch_error(key, &err),
                }
            }
            BatchStatus::Error => self.fetch_error(
                key,
                &RemoteError::protocol(entry.error.unwrap_or_else(|| "unknown error".into())),
            ),
            BatchStatus::Contains => self.fetch_error(
                key,
                &RemoteError::protocol("Batch fetch answered with a contains status"),
            ),
        }
    }

    /// POST a batch request and index the answers by key.
    ///
    /// Any malformed response fails the whole batch.
    async fn post_batch(
        &self,
        endpoint: &str,
        operation: &str,
        keys: &[RuleKey],
    ) -> Result<HashMap<RuleKey, BatchResult>> {
        let request = HttpRequest::post_json(
            protocol::batch_path(endpoint, operation),
            &BatchKeysRequest {
                rule_keys: keys.to_vec(),
            },
        )?
        .headers(&self.options.read_headers);
        let response = self.fetch_service.make_request(request).await?;
        if !response.is_success() {
            return Err(RemoteError::status(response.status(), response.url()));
        }
        let body = response.bytes().await?;
        let parsed: BatchResponse = serde_json::from_slice(&body)
            .map_err(|e| RemoteError::protocol(format!("Malformed batch {operation} response: {e}")))?;
        Ok(parsed
            .results
            .into_iter()
            .map(|entry| (entry.rule_key.clone(), entry))
            .collect())
    }

    async fn contains_one(&self, key: &RuleKey) -> CacheResult {
        let request =
            HttpRequest::head(protocol::artifact_path(key)).headers(&self.options.read_headers);
        match self.fetch_service.make_request(request).await {
            Ok(response) if response.is_success() => {
                CacheResult::contains(&self.options.name, self.options.cache_mode)
            }
            Ok(response) if response.status() == 404 => CacheResult::miss(),
            Ok(response) => {
                self.fetch_error(key, &RemoteError::status(response.status(), response.url()))
            }
            Err(err) => self.fetch_error(key, &err),
        }
    }

    async fn batch_contains(&self, endpoint: &str, keys: &[RuleKey]) -> HashMap<RuleKey, CacheResult> {
        let mut results = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(self.options.multi_fetch_limit) {
            match self.post_batch(endpoint, "contains", chunk).await {
                Ok(mut by_key) => {
                    for key in chunk {
                        let result = match by_key.remove(key).map(|entry| entry.status) {
                            Some(BatchStatus::Contains | BatchStatus::Hit) => {
                                CacheResult::contains(&self.options.name, self.options.cache_mode)
                            }
                            Some(BatchStatus::Miss) => CacheResult::miss(),
                            Some(BatchStatus::Error) => self.fetch_error(
                                key,
                                &RemoteError::protocol("Server failed to check this key"),
                            ),
                            None => self.fetch_error(
                                key,
                                &RemoteError::protocol("Batch response has no result for this key"),
                            ),
                        };
                        results.insert(key.clone(), result);
                    }
                }
                Err(err) => {
                    for key in chunk {
                        results.insert(key.clone(), self.fetch_error(key, &err));
                    }
                }
            }
        }
        results
    }

    async fn send_store(&self, info: &ArtifactInfo, source: &Path) -> Result<()> {
        let owned_info = info.clone();
        let owned_source = source.to_path_buf();
        let frame = tokio::task::spawn_blocking(move || {
            protocol::write_frame_file(&owned_info, &owned_source)
        })
        .await
        .map_err(|e| RemoteError::protocol(format!("Framing task failed: {e}")))??;

        let request = HttpRequest::put(STORE_PATH, RequestBody::File(frame.path().to_path_buf()))
            .header("Content-Type", "application/octet-stream")
            .headers(&self.options.write_headers);
        let response = self.store_service.make_request(request).await?;
        if !response.is_success() {
            return Err(RemoteError::status(response.status(), response.url()));
        }
        drop(frame);
        Ok(())
    }

    async fn delete_each(&self, keys: &[RuleKey]) -> Result<BTreeSet<RuleKey>> {
        let mut deleted = BTreeSet::new();
        for key in keys {
            let request =
                HttpRequest::delete(protocol::artifact_path(key)).headers(&self.options.write_headers);
            let response = self.store_service.make_request(request).await?;
            match response.status() {
                200 | 204 => {
                    deleted.insert(key.clone());
                }
                404 => {}
                status => return Err(RemoteError::status(status, response.url())),
            }
        }
        Ok(deleted)
    }

    async fn delete_batch(&self, endpoint: &str, keys: &[RuleKey]) -> Result<BTreeSet<RuleKey>> {
        let request = HttpRequest::post_json(
            protocol::batch_path(endpoint, "delete"),
            &BatchKeysRequest {
                rule_keys: keys.to_vec(),
            },
        )?
        .headers(&self.options.write_headers);
        let response = self.store_service.make_request(request).await?;
        if !response.is_success() {
            return Err(RemoteError::status(response.status(), response.url()));
        }
        let body = response.bytes().await?;
        let parsed: BatchDeleteResponse = serde_json::from_slice(&body)
            .map_err(|e| RemoteError::protocol(format!("Malformed batch delete response: {e}")))?;
        let requested: BTreeSet<&RuleKey> = keys.iter().collect();
        Ok(parsed
            .deleted
            .into_iter()
            .filter(|key| requested.contains(key))
            .collect())
    }
}

#[async_trait]
impl ArtifactCache for NetworkCache {
    fn name(&self) -> &str {
        &self.options.name
    }

    async fn fetch(&self, _target: Option<&str>, key: &RuleKey, output: &Path) -> CacheResult {
        if self.skip.is_cancelled() {
            return CacheResult::skipped();
        }
        tokio::select! {
            biased;
            () = self.skip.cancelled() => CacheResult::skipped(),
            result = self.fetch_one(key, output) => result,
        }
    }

    async fn fetch_many(
        &self,
        target: Option<&str>,
        requests: &[(RuleKey, PathBuf)],
    ) -> Vec<CacheResult> {
        if let Some(endpoint) = self.batch_endpoint() {
            return self.batch_fetch(endpoint, requests).await;
        }
        let mut results = Vec::with_capacity(requests.len());
        for (key, output) in requests {
            results.push(self.fetch(target, key, output).await);
        }
        results
    }

    async fn contains_many(&self, keys: &[RuleKey]) -> HashMap<RuleKey, CacheResult> {
        if let Some(endpoint) = self.batch_endpoint() {
            if self.options.multi_check {
                return self.batch_contains(endpoint, keys).await;
            }
        }
        let mut results = HashMap::with_capacity(keys.len());
        for key in keys {
            results.insert(key.clone(), self.contains_one(key).await);
        }
        results
    }

    async fn store(&self, info: &ArtifactInfo, source: &ArtifactSource) -> artcache_core::Result<()> {
        if !self.options.read_mode.is_writable() {
            return Ok(());
        }
        let _permit = self.write_permits.acquire().await.map_err(|_| {
            artcache_core::Error::backend(&self.options.name, "cache is closed")
        })?;
        debug!(
            cache = %self.options.name,
            rule_keys = ?info.rule_keys(),
            "Storing artifact"
        );
        self.send_store(info, source.path())
            .await
            .map_err(|e| e.into_cache_error(&self.options.name))
    }

    async fn delete(&self, keys: &[RuleKey]) -> artcache_core::Result<CacheDeleteResult> {
        if !self.options.read_mode.is_writable() || keys.is_empty() {
            return Ok(CacheDeleteResult::for_cache(&self.options.name, BTreeSet::new()));
        }
        let deleted = match self.batch_endpoint() {
            Some(endpoint) => self.delete_batch(endpoint, keys).await,
            None => self.delete_each(keys).await,
        }
        .map_err(|e| e.into_cache_error(&self.options.name))?;
        Ok(CacheDeleteResult::for_cache(&self.options.name, deleted))
    }

    fn read_mode(&self) -> CacheReadMode {
        self.options.read_mode
    }

    fn skip_pending_and_future_fetches(&self) {
        self.skip.cancel();
    }

    async fn close(&self) -> artcache_core::Result<()> {
        if !self.write_permits.is_closed() {
            // Wait for in-flight stores before refusing new ones
            if let Ok(permits) = self.write_permits.acquire_many(self.max_writes).await {
                permits.forget();
            }
            self.write_permits.close();
        }
        self.fetch_service.close();
        self.store_service.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeHttpService, InMemoryCacheServer};
    use artcache_core::CacheResultType;
    use artcache_events::RecordingEventSink;
    use std::time::Duration;
    use tempfile::TempDir;

    fn key(hex: &str) -> RuleKey {
        RuleKey::from_hex(hex).unwrap()
    }

    fn cache_on(server: &Arc<InMemoryCacheServer>, options: NetworkCacheOptions) -> NetworkCache {
        let service: SharedHttpService = Arc::new(server.service());
        NetworkCache::new(options, service.clone(), service).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_hit_and_miss() {
        let server = InMemoryCacheServer::new();
        server.insert(key("aa"), b"remote payload");
        let cache = cache_on(&server, NetworkCacheOptions::new("http", "cache"));
        let tmp = TempDir::new().unwrap();

        let out = tmp.path().join("hit");
        let result = cache.fetch(None, &key("aa"), &out).await;
        assert_eq!(result.kind(), CacheResultType::Hit);
        assert_eq!(result.artifact_size(), Some(14));
        assert_eq!(std::fs::read(&out).unwrap(), b"remote payload");

        let out = tmp.path().join("miss");
        let result = cache.fetch(None, &key("bb"), &out).await;
        assert_eq!(result.kind(), CacheResultType::Miss);
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_store_then_fetch_carries_metadata() {
        let server = InMemoryCacheServer::new();
        let cache = cache_on(&server, NetworkCacheOptions::new("http", "cache"));
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("src");
        std::fs::write(&source, b"built").unwrap();

        let info = ArtifactInfo::builder()
            .rule_key(key("01"))
            .rule_key(key("02"))
            .metadata("origin", "ci")
            .build()
            .unwrap();
        cache.store(&info, &ArtifactSource::copy_from(&source)).await.unwrap();
        assert_eq!(server.len(), 2);
        assert!(source.exists());

        let out = tmp.path().join("out");
        let result = cache.fetch(None, &key("02"), &out).await;
        assert_eq!(result.metadata().get("origin").map(String::as_str), Some("ci"));
        assert_eq!(std::fs::read(&out).unwrap(), b"built");
    }

    #[tokio::test]
    async fn test_readonly_cache_sends_no_writes() {
        let server = InMemoryCacheServer::new();
        let mut options = NetworkCacheOptions::new("http", "cache");
        options.read_mode = CacheReadMode::ReadOnly;
        let cache = cache_on(&server, options);
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("src");
        std::fs::write(&source, b"x").unwrap();

        cache
            .store(&ArtifactInfo::for_key(key("aa")), &ArtifactSource::copy_from(&source))
            .await
            .unwrap();
        assert!(server.is_empty());
        let deleted = cache.delete(&[key("aa")]).await.unwrap();
        assert!(deleted.deleted.is_empty());
    }

    #[tokio::test]
    async fn test_server_error_uses_template() {
        let fake: SharedHttpService = Arc::new(FakeHttpService::new(|_| Ok((503, Vec::new()))));
        let mut options = NetworkCacheOptions::new("remote", "cache.example.com");
        options.error_message_format = "{cache_name}@{host}: {error_message}".into();
        options.error_message_limit = 8;
        let cache = NetworkCache::new(options, fake.clone(), fake).unwrap();

        let tmp = TempDir::new().unwrap();
        let result = cache.fetch(None, &key("aa"), &tmp.path().join("o")).await;
        assert_eq!(result.kind(), CacheResultType::Error);
        assert_eq!(result.cache_error(), Some("remote@cache.example.com: HTTP 503"));
    }

    #[tokio::test]
    async fn test_corrupt_frame_is_error_and_leaves_no_file() {
        let fake: SharedHttpService = Arc::new(FakeHttpService::new(|_| {
            let info = ArtifactInfo::for_key(RuleKey::from_hex("aa").unwrap());
            let mut frame = protocol::encode_frame(&info, b"payload").unwrap().to_vec();
            frame.truncate(frame.len() - 2);
            Ok((200, frame))
        }));
        let cache = NetworkCache::new(NetworkCacheOptions::new("http", "h"), fake.clone(), fake).unwrap();
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("o");

        let result = cache.fetch(None, &key("aa"), &out).await;
        assert_eq!(result.kind(), CacheResultType::Error);
        assert!(!out.exists());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_first_failure_is_reported_once() {
        let fake: SharedHttpService = Arc::new(FakeHttpService::new(|_| Ok((503, Vec::new()))));
        let sink = Arc::new(RecordingEventSink::new());
        let mut options = NetworkCacheOptions::new("http", "cache.example.com");
        options.event_sink = sink.clone();
        let cache = NetworkCache::new(options, fake.clone(), fake).unwrap();

        let tmp = TempDir::new().unwrap();
        for hex in ["aa", "bb", "cc"] {
            let result = cache.fetch(None, &key(hex), &tmp.path().join(hex)).await;
            assert_eq!(result.kind(), CacheResultType::Error);
        }

        let warnings: Vec<String> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e.category {
                EventCategory::Warning { message } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("The http cache encountered an error."));
    }

    #[tokio::test]
    async fn test_bytes_received_per_chunk() {
        let server = InMemoryCacheServer::new();
        server.insert(key("aa"), &[7u8; 100]);
        let server_for_fake = server.clone();
        let fake: SharedHttpService = Arc::new(
            FakeHttpService::new(move |request| Ok(server_for_fake.handle(request)))
                .with_chunk_size(32),
        );
        let sink = Arc::new(RecordingEventSink::new());
        let mut options = NetworkCacheOptions::new("http", "h");
        options.event_sink = sink.clone();
        let cache = NetworkCache::new(options, fake.clone(), fake).unwrap();

        let tmp = TempDir::new().unwrap();
        let result = cache.fetch(None, &key("aa"), &tmp.path().join("o")).await;
        assert_eq!(result.kind(), CacheResultType::Hit);

        let received: Vec<u64> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e.category {
                EventCategory::BytesReceived { bytes } => Some(bytes),
                _ => None,
            })
            .collect();
        assert!(received.len() > 1);
        assert!(received.iter().all(|b| *b <= 32));
    }

    #[tokio::test]
    async fn test_skip_resolves_pending_fetch() {
        tokio::time::pause();
        let fake: SharedHttpService = Arc::new(
            FakeHttpService::new(|_| Ok((404, Vec::new()))).with_delay(Duration::from_secs(60)),
        );
        let cache = Arc::new(
            NetworkCache::new(NetworkCacheOptions::new("http", "h"), fake.clone(), fake).unwrap(),
        );
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("o");

        let pending = {
            let cache = cache.clone();
            let out = out.clone();
            tokio::spawn(async move { cache.fetch(None, &key("aa"), &out).await })
        };
        tokio::task::yield_now().await;
        cache.skip_pending_and_future_fetches();

        assert_eq!(pending.await.unwrap().kind(), CacheResultType::Skipped);
        assert_eq!(
            cache.fetch(None, &key("bb"), &out).await.kind(),
            CacheResultType::Skipped
        );
    }

    #[tokio::test]
    async fn test_head_contains() {
        let server = InMemoryCacheServer::new();
        server.insert(key("aa"), b"x");
        let cache = cache_on(&server, NetworkCacheOptions::new("http", "h"));
        let results = cache.contains_many(&[key("aa"), key("bb")]).await;
        assert_eq!(results[&key("aa")].kind(), CacheResultType::Contains);
        assert_eq!(results[&key("bb")].kind(), CacheResultType::Miss);
    }

    #[tokio::test]
    async fn test_delete_each_key() {
        let server = InMemoryCacheServer::new();
        server.insert(key("aa"), b"x");
        let cache = cache_on(&server, NetworkCacheOptions::new("http", "h"));
        let result = cache.delete(&[key("aa"), key("bb")]).await.unwrap();
        assert_eq!(result.deleted, BTreeSet::from([key("aa")]));
        assert_eq!(result.cache_names, vec!["http".to_string()]);
    }

    #[tokio::test]
    async fn test_close_closes_transports_and_refuses_stores() {
        let fetch = Arc::new(FakeHttpService::new(|_| Ok((200, Vec::new()))));
        let store = Arc::new(FakeHttpService::new(|_| Ok((200, Vec::new()))));
        let cache = NetworkCache::new(
            NetworkCacheOptions::new("http", "h"),
            fetch.clone(),
            store.clone(),
        )
        .unwrap();
        cache.close().await.unwrap();
        cache.close().await.unwrap();
        assert!(fetch.was_closed());
        assert!(store.was_closed());

        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("src");
        std::fs::write(&source, b"x").unwrap();
        assert!(
            cache
                .store(&ArtifactInfo::for_key(key("aa")), &ArtifactSource::copy_from(&source))
                .await
                .is_err()
        );
    }

    #[test]
    fn test_rejects_invalid_options() {
        let fake: SharedHttpService = Arc::new(FakeHttpService::new(|_| Ok((200, Vec::new()))));
        let mut options = NetworkCacheOptions::new("http", "h");
        options.max_concurrent_writes = 0;
        assert!(NetworkCache::new(options, fake.clone(), fake.clone()).is_err());

        let mut options = NetworkCacheOptions::new("dir", "h");
        options.cache_mode = ArtifactCacheMode::Dir;
        assert!(NetworkCache::new(options, fake.clone(), fake).is_err());
    }
}
