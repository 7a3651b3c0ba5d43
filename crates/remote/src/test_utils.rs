//! In-memory transport fakes for testing network caches without sockets

use crate::error::{RemoteError, Result};
use crate::protocol::{
    self, BatchDeleteResponse, BatchKeysRequest, BatchResponse, BatchResult, DigestList,
    FIND_MISSING_PATH, STORE_PATH,
};
use crate::transport::{HttpMethod, HttpRequest, HttpResponse, HttpService, RequestBody};
use artcache_core::{Digest, RuleKey};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A request as seen by [`FakeHttpService`], with file bodies read in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    /// Method
    pub method: HttpMethod,
    /// Path relative to the base URL
    pub path: String,
    /// Request headers
    pub headers: BTreeMap<String, String>,
    /// Body bytes
    pub body: Bytes,
}

type Handler = dyn Fn(&RecordedRequest) -> Result<(u16, Vec<u8>)> + Send + Sync;

/// Transport that answers every request with a closure.
///
/// The closure returns a status and body, or a transport error.
pub struct FakeHttpService {
    handler: Box<Handler>,
    requests: Mutex<Vec<RecordedRequest>>,
    closed: AtomicBool,
    delay: Option<Duration>,
    chunk_size: Option<usize>,
}

impl FakeHttpService {
    /// Fake answering with `handler`
    pub fn new(
        handler: impl Fn(&RecordedRequest) -> Result<(u16, Vec<u8>)> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            delay: None,
            chunk_size: None,
        }
    }

    /// Sleep before answering each request
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Stream response bodies in chunks of `size` bytes
    #[must_use]
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size.max(1));
        self
    }

    /// Every request received so far
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Number of requests received
    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }

    /// Whether `close` was called
    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpService for FakeHttpService {
    async fn make_request(&self, request: HttpRequest) -> Result<HttpResponse> {
        let body = match &request.body {
            RequestBody::Empty => Bytes::new(),
            RequestBody::Bytes(bytes) => bytes.clone(),
            RequestBody::File(path) => tokio::fs::read(path)
                .await
                .map(Bytes::from)
                .map_err(|e| RemoteError::io(e, path, "read"))?,
        };
        let recorded = RecordedRequest {
            method: request.method,
            path: request.path,
            headers: request.headers,
            body,
        };
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(recorded.clone());
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let (status, body) = (self.handler)(&recorded)?;
        let url = format!("http://fake/{}", recorded.path);
        let response = match self.chunk_size {
            Some(size) => {
                let chunks: Vec<Result<Bytes>> = body
                    .chunks(size)
                    .map(|c| Ok(Bytes::copy_from_slice(c)))
                    .collect();
                HttpResponse::new(status, url, futures::stream::iter(chunks).boxed())
            }
            None => HttpResponse::from_bytes(status, url, body),
        };
        Ok(response)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// In-memory cache server speaking the artifact, batch and CAS protocols.
///
/// Serve it through [`InMemoryCacheServer::service`].
#[derive(Default)]
pub struct InMemoryCacheServer {
    frames: Mutex<HashMap<RuleKey, Vec<u8>>>,
    blobs: Mutex<HashMap<Digest, Vec<u8>>>,
    malformed_batches: AtomicBool,
}

impl InMemoryCacheServer {
    /// Empty server
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport whose requests this server answers
    #[must_use]
    pub fn service(self: &Arc<Self>) -> FakeHttpService {
        let server = Arc::clone(self);
        FakeHttpService::new(move |request| Ok(server.handle(request)))
    }

    /// Answer batch requests with invalid JSON from now on
    pub fn break_batches(&self) {
        self.malformed_batches.store(true, Ordering::SeqCst);
    }

    /// Store `payload` under `key` directly
    pub fn insert(&self, key: RuleKey, payload: &[u8]) {
        let info = artcache_core::ArtifactInfo::for_key(key.clone());
        if let Ok(frame) = protocol::encode_frame(&info, payload) {
            if let Ok(mut frames) = self.frames.lock() {
                frames.insert(key, frame.to_vec());
            }
        }
    }

    /// Stored payload for `key`
    pub fn payload(&self, key: &RuleKey) -> Option<Vec<u8>> {
        let frame = self.frames.lock().ok()?.get(key).cloned()?;
        protocol::decode_frame(&frame).ok().map(|(_, p)| p.to_vec())
    }

    /// Stored metadata for `key`
    pub fn metadata(&self, key: &RuleKey) -> Option<BTreeMap<String, String>> {
        let frame = self.frames.lock().ok()?.get(key).cloned()?;
        protocol::decode_frame(&frame).ok().map(|(h, _)| h.metadata)
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.frames.lock().map(|f| f.len()).unwrap_or_default()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of stored CAS blobs
    pub fn blob_count(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or_default()
    }

    /// Answer one request
    pub fn handle(&self, request: &RecordedRequest) -> (u16, Vec<u8>) {
        let path = request.path.trim_start_matches('/');
        if path == STORE_PATH && request.method == HttpMethod::Put {
            return self.store(&request.body);
        }
        if let Some(hex) = path.strip_prefix("artifacts/key/") {
            let Ok(key) = RuleKey::from_hex(hex) else {
                return (400, b"bad key".to_vec());
            };
            return self.keyed(request.method, &key);
        }
        if path == FIND_MISSING_PATH {
            return self.find_missing(&request.body);
        }
        if let Some(rest) = path.strip_prefix("cas/blobs/") {
            return self.blob(request.method, rest, &request.body);
        }
        if request.method == HttpMethod::Post {
            if let Some(operation) = path.rsplit('/').next() {
                return self.batch(operation, &request.body);
            }
        }
        (404, Vec::new())
    }

    fn store(&self, frame: &[u8]) -> (u16, Vec<u8>) {
        let Ok((header, _)) = protocol::decode_frame(frame) else {
            return (400, b"bad frame".to_vec());
        };
        if let Ok(mut frames) = self.frames.lock() {
            for key in header.rule_keys {
                frames.insert(key, frame.to_vec());
            }
        }
        (200, Vec::new())
    }

    fn keyed(&self, method: HttpMethod, key: &RuleKey) -> (u16, Vec<u8>) {
        let Ok(mut frames) = self.frames.lock() else {
            return (500, Vec::new());
        };
        match method {
            HttpMethod::Get => frames
                .get(key)
                .map_or((404, Vec::new()), |frame| (200, frame.clone())),
            HttpMethod::Head if frames.contains_key(key) => (200, Vec::new()),
            HttpMethod::Delete if frames.remove(key).is_some() => (204, Vec::new()),
            HttpMethod::Head | HttpMethod::Delete => (404, Vec::new()),
            HttpMethod::Put | HttpMethod::Post => (405, Vec::new()),
        }
    }

    fn batch(&self, operation: &str, body: &[u8]) -> (u16, Vec<u8>) {
        if self.malformed_batches.load(Ordering::SeqCst) {
            return (200, b"{\"results\": [oops".to_vec());
        }
        let Ok(request) = serde_json::from_slice::<BatchKeysRequest>(body) else {
            return (400, b"bad batch".to_vec());
        };
        let Ok(mut frames) = self.frames.lock() else {
            return (500, Vec::new());
        };
        let encoded = match operation {
            "fetch" => serde_json::to_vec(&BatchResponse {
                results: request
                    .rule_keys
                    .into_iter()
                    .map(|key| match frames.get(&key) {
                        Some(frame) => BatchResult::hit(key, frame),
                        None => BatchResult::miss(key),
                    })
                    .collect(),
            }),
            "contains" => serde_json::to_vec(&BatchResponse {
                results: request
                    .rule_keys
                    .into_iter()
                    .map(|key| {
                        if frames.contains_key(&key) {
                            BatchResult::contains(key)
                        } else {
                            BatchResult::miss(key)
                        }
                    })
                    .collect(),
            }),
            "delete" => serde_json::to_vec(&BatchDeleteResponse {
                deleted: request
                    .rule_keys
                    .into_iter()
                    .filter(|key| frames.remove(key).is_some())
                    .collect(),
            }),
            _ => return (404, Vec::new()),
        };
        encoded.map_or((500, Vec::new()), |body| (200, body))
    }

    fn find_missing(&self, body: &[u8]) -> (u16, Vec<u8>) {
        let Ok(request) = serde_json::from_slice::<DigestList>(body) else {
            return (400, Vec::new());
        };
        let Ok(blobs) = self.blobs.lock() else {
            return (500, Vec::new());
        };
        let missing = DigestList {
            digests: request
                .digests
                .into_iter()
                .filter(|d| !blobs.contains_key(d))
                .collect(),
        };
        serde_json::to_vec(&missing).map_or((500, Vec::new()), |body| (200, body))
    }

    fn blob(&self, method: HttpMethod, rest: &str, body: &[u8]) -> (u16, Vec<u8>) {
        let Some((hash, size)) = rest.split_once('/') else {
            return (400, Vec::new());
        };
        let Some(digest) = size.parse().ok().and_then(|size| Digest::new(hash, size).ok()) else {
            return (400, Vec::new());
        };
        let Ok(mut blobs) = self.blobs.lock() else {
            return (500, Vec::new());
        };
        match method {
            HttpMethod::Put if Digest::of(body) == digest => {
                blobs.insert(digest, body.to_vec());
                (200, Vec::new())
            }
            HttpMethod::Put => (400, b"digest mismatch".to_vec()),
            HttpMethod::Get => blobs
                .get(&digest)
                .map_or((404, Vec::new()), |blob| (200, blob.clone())),
            _ => (405, Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_records_requests() {
        let fake = FakeHttpService::new(|request| Ok((200, request.body.to_vec())));
        let response = fake
            .make_request(HttpRequest::put("echo", RequestBody::Bytes(Bytes::from_static(b"hi"))))
            .await
            .unwrap();
        assert_eq!(response.bytes().await.unwrap().as_ref(), b"hi");
        assert_eq!(fake.requests()[0].method, HttpMethod::Put);
        assert!(!fake.was_closed());
        fake.close();
        assert!(fake.was_closed());
    }

    #[tokio::test]
    async fn test_server_round_trip() {
        let server = InMemoryCacheServer::new();
        let key = RuleKey::from_hex("beef").unwrap();
        server.insert(key.clone(), b"content");
        assert_eq!(server.payload(&key).unwrap(), b"content");

        let service = server.service();
        let response = service
            .make_request(HttpRequest::head("artifacts/key/beef"))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let response = service
            .make_request(HttpRequest::delete("artifacts/key/beef"))
            .await
            .unwrap();
        assert_eq!(response.status(), 204);
        assert!(server.is_empty());
    }
}
