//! HTTP transport used by network caches.
//!
//! A [`HttpService`] sends one request to "the cache server", whatever that
//! means for the implementation: a single URI, a load-balanced pool, or a
//! retrying wrapper around either. Non-2xx statuses are responses, not
//! errors. Only transport failures are `Err`.

mod retrying;
mod single;
mod slb;

pub use retrying::RetryingHttpService;
pub use single::{HttpClientOptions, SingleUriService, build_client};
pub use slb::{ClientSideSlb, LoadBalancedService};

use crate::error::{RemoteError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Shared handle to a transport
pub type SharedHttpService = Arc<dyn HttpService>;

/// Streamed response body
pub type ResponseBody = BoxStream<'static, Result<Bytes>>;

/// HTTP methods used by the cache protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// GET
    Get,
    /// HEAD
    Head,
    /// PUT
    Put,
    /// POST
    Post,
    /// DELETE
    Delete,
}

impl HttpMethod {
    /// Method name as sent on the wire
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Put => "PUT",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request payload.
///
/// File bodies are re-opened for every attempt, so a request can be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// No body
    Empty,
    /// In-memory body
    Bytes(Bytes),
    /// Body streamed from a file
    File(PathBuf),
}

/// A request relative to the service's base URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method
    pub method: HttpMethod,
    /// Path relative to the base URL
    pub path: String,
    /// Extra headers
    pub headers: BTreeMap<String, String>,
    /// Payload
    pub body: RequestBody,
}

impl HttpRequest {
    /// Request without headers or body
    #[must_use]
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: BTreeMap::new(),
            body: RequestBody::Empty,
        }
    }

    /// GET `path`
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    /// HEAD `path`
    #[must_use]
    pub fn head(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Head, path)
    }

    /// DELETE `path`
    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, path)
    }

    /// PUT `body` to `path`
    #[must_use]
    pub fn put(path: impl Into<String>, body: RequestBody) -> Self {
        Self::new(HttpMethod::Put, path).body(body)
    }

    /// POST `value` to `path` as JSON.
    ///
    /// # Errors
    ///
    /// Returns error if `value` cannot be serialized
    pub fn post_json<T: Serialize + ?Sized>(path: impl Into<String>, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| RemoteError::serialization(format!("Failed to encode request: {e}")))?;
        Ok(Self::new(HttpMethod::Post, path)
            .header("Content-Type", "application/json")
            .body(RequestBody::Bytes(Bytes::from(body))))
    }

    /// Add a header
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add several headers
    #[must_use]
    pub fn headers(mut self, headers: &BTreeMap<String, String>) -> Self {
        self.headers
            .extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Replace the body
    #[must_use]
    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }
}

/// Response with a streamed body
pub struct HttpResponse {
    status: u16,
    url: String,
    headers: BTreeMap<String, String>,
    body: ResponseBody,
}

impl HttpResponse {
    /// Response with a streamed body
    #[must_use]
    pub fn new(status: u16, url: impl Into<String>, body: ResponseBody) -> Self {
        Self {
            status,
            url: url.into(),
            headers: BTreeMap::new(),
            body,
        }
    }

    /// Response with an in-memory body
    #[must_use]
    pub fn from_bytes(status: u16, url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        let stream = if body.is_empty() {
            futures::stream::empty::<Result<Bytes>>().boxed()
        } else {
            futures::stream::once(async move { Ok(body) }).boxed()
        };
        Self::new(status, url, stream)
    }

    /// Add a response header (names are stored lower-case)
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// HTTP status code
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Final request URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the status is 2xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Header value, looked up case-insensitively
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// The body as a stream of chunks
    #[must_use]
    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Collect the whole body.
    ///
    /// # Errors
    ///
    /// Returns the first error from the body stream
    pub async fn bytes(self) -> Result<Bytes> {
        let mut body = self.body;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// A way of sending requests to a cache server
#[async_trait]
pub trait HttpService: Send + Sync {
    /// Send `request` and return the server's response.
    ///
    /// # Errors
    ///
    /// Returns error only if no response was received
    async fn make_request(&self, request: HttpRequest) -> Result<HttpResponse>;

    /// Release pooled connections. Safe to call more than once.
    fn close(&self) {}
}
