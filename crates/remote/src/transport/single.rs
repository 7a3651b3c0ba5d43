//! Requests against one fixed base URL

use super::{HttpMethod, HttpRequest, HttpResponse, HttpService, RequestBody, ResponseBody};
use crate::error::{RemoteError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Url;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::trace;

/// Client settings shared by every request a service sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpClientOptions {
    /// Whole-request timeout
    pub timeout: Duration,
    /// TCP/TLS connect timeout
    pub connect_timeout: Option<Duration>,
    /// Longest wait for any single body chunk
    pub read_timeout: Option<Duration>,
    /// Idle connections kept per host
    pub max_idle_per_host: usize,
    /// Headers added to every request
    pub default_headers: BTreeMap<String, String>,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            connect_timeout: None,
            read_timeout: None,
            max_idle_per_host: 200,
            default_headers: BTreeMap::new(),
        }
    }
}

/// Build a reqwest client from `options`.
///
/// # Errors
///
/// Returns error if a default header is not a valid HTTP header or the TLS
/// backend fails to initialize
pub fn build_client(options: &HttpClientOptions) -> Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in &options.default_headers {
        let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RemoteError::Config(format!("Invalid header name '{name}': {e}")))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|e| RemoteError::Config(format!("Invalid value for header {name}: {e}")))?;
        headers.insert(name, value);
    }

    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("artcache/", env!("CARGO_PKG_VERSION")))
        .default_headers(headers)
        .timeout(options.timeout)
        .pool_max_idle_per_host(options.max_idle_per_host);
    if let Some(connect) = options.connect_timeout {
        builder = builder.connect_timeout(connect);
    }
    builder
        .build()
        .map_err(|e| RemoteError::Config(format!("Failed to create HTTP client: {e}")))
}

/// Parse a base URL, making sure relative paths join beneath it
pub(crate) fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).map_err(|e| RemoteError::invalid_url(raw, e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(RemoteError::invalid_url(raw, "scheme must be http or https"));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Send `request` to `base` with `client`.
///
/// Shared by every reqwest-backed service.
pub(crate) async fn send(
    client: &reqwest::Client,
    base: &Url,
    request: HttpRequest,
    options: &HttpClientOptions,
) -> Result<HttpResponse> {
    let url = base
        .join(request.path.trim_start_matches('/'))
        .map_err(|e| RemoteError::invalid_url(&request.path, e.to_string()))?;
    let method = match request.method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Delete => reqwest::Method::DELETE,
    };
    trace!(method = %request.method, url = %url, "Sending cache request");

    let mut builder = client.request(method, url.clone());
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder = match request.body {
        RequestBody::Empty => builder,
        RequestBody::Bytes(bytes) => builder.body(bytes),
        RequestBody::File(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| RemoteError::io(e, &path, "open"))?;
            let len = file
                .metadata()
                .await
                .map_err(|e| RemoteError::io(e, &path, "metadata"))?
                .len();
            builder
                .header(reqwest::header::CONTENT_LENGTH, len)
                .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
        }
    };

    let timeout_secs = options.timeout.as_secs();
    let response = builder
        .send()
        .await
        .map_err(|e| RemoteError::from_reqwest(&e, url.as_str(), timeout_secs))?;

    let status = response.status().as_u16();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let body_url = url.to_string();
    let body = response
        .bytes_stream()
        .map(move |chunk| chunk.map_err(|e| RemoteError::from_reqwest(&e, &body_url, timeout_secs)))
        .boxed();
    let body = with_read_timeout(body, options.read_timeout);

    let mut response = HttpResponse::new(status, url.as_str(), body);
    for (name, value) in headers {
        response = response.with_header(&name, value);
    }
    Ok(response)
}

/// Fail the body if any single chunk takes longer than `timeout`
fn with_read_timeout(body: ResponseBody, timeout: Option<Duration>) -> ResponseBody {
    let Some(timeout) = timeout else {
        return body;
    };
    futures::stream::unfold(Some(body), move |state| async move {
        let mut body = state?;
        match tokio::time::timeout(timeout, body.next()).await {
            Ok(Some(chunk)) => Some((chunk, Some(body))),
            Ok(None) => None,
            Err(_) => Some((
                Err(RemoteError::timeout("response body read", timeout.as_secs())),
                None,
            )),
        }
    })
    .boxed()
}

/// Sends every request to one base URL
pub struct SingleUriService {
    base: Url,
    client: reqwest::Client,
    options: HttpClientOptions,
}

impl SingleUriService {
    /// Create a service for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns error if the URL is not http(s) or the client cannot be built
    pub fn new(base_url: &str, options: HttpClientOptions) -> Result<Self> {
        let base = parse_base_url(base_url)?;
        let client = build_client(&options)?;
        Ok(Self {
            base,
            client,
            options,
        })
    }

    /// Base URL requests are resolved against
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base
    }
}

#[async_trait]
impl HttpService for SingleUriService {
    async fn make_request(&self, request: HttpRequest) -> Result<HttpResponse> {
        send(&self.client, &self.base, request, &self.options).await
    }
}
