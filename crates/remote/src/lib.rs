//! Remote caches for artcache.
//!
//! This crate provides the network side of the artifact cache:
//!
//! - [`transport`]: the [`HttpService`] contract with single-URI,
//!   client-side load balanced and retrying implementations
//! - [`protocol`]: artifact frames and batch request/response bodies
//! - [`NetworkCache`]: an [`artcache_core::ArtifactCache`] backed by a cache
//!   server
//! - [`HttpContentStore`]: a remote [`artcache_core::ContentAddressedStorage`]
//!
//! Transport failures surface as [`RemoteError`] inside this crate and are
//! converted to fetch results or [`artcache_core::Error`] at the cache
//! boundary.

pub mod cas;
pub mod error;
pub mod network;
pub mod protocol;
pub mod retry;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;

pub use cas::HttpContentStore;
pub use error::{RemoteError, Result};
pub use network::{NetworkCache, NetworkCacheOptions};
pub use retry::{RetryConfig, retry_with_backoff};
pub use transport::{
    ClientSideSlb, HttpClientOptions, HttpMethod, HttpRequest, HttpResponse, HttpService,
    LoadBalancedService, RequestBody, RetryingHttpService, SharedHttpService, SingleUriService,
    build_client,
};
