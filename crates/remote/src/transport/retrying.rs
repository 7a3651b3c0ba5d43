//! Transport-level retries

use super::{HttpRequest, HttpResponse, HttpService, SharedHttpService};
use crate::error::Result;
use crate::retry::{RetryConfig, retry_with_backoff};
use async_trait::async_trait;

/// Re-sends a request when the transport fails.
///
/// Responses are never retried, whatever their status. Retrying on status
/// belongs to the cache layer.
pub struct RetryingHttpService {
    delegate: SharedHttpService,
    config: RetryConfig,
    operation: String,
}

impl RetryingHttpService {
    /// Wrap `delegate`. `operation` names the request kind in logs.
    #[must_use]
    pub fn new(delegate: SharedHttpService, config: RetryConfig, operation: impl Into<String>) -> Self {
        Self {
            delegate,
            config,
            operation: operation.into(),
        }
    }
}

#[async_trait]
impl HttpService for RetryingHttpService {
    async fn make_request(&self, request: HttpRequest) -> Result<HttpResponse> {
        let delegate = &self.delegate;
        retry_with_backoff(&self.config, &self.operation, || {
            let request = request.clone();
            async move { delegate.make_request(request).await }
        })
        .await
    }

    fn close(&self) {
        self.delegate.close();
    }
}
