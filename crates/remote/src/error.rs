//! Error types for remote caches and their transport

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for HTTP transport and network cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum RemoteError {
    /// Could not reach the server
    #[error("Failed to connect to {endpoint}: {message}")]
    #[diagnostic(
        code(artcache_remote::connection_failed),
        help("Check that the cache server is running and reachable")
    )]
    ConnectionFailed {
        /// Server that could not be reached
        endpoint: String,
        /// Transport error text
        message: String,
    },

    /// A request or body read took too long
    #[error("{operation} timed out after {seconds}s")]
    #[diagnostic(code(artcache_remote::timeout))]
    Timeout {
        /// What was being done
        operation: String,
        /// Timeout that elapsed
        seconds: u64,
    },

    /// Server answered with an unexpected status
    #[error("HTTP {status} from {url}")]
    #[diagnostic(code(artcache_remote::status))]
    Status {
        /// HTTP status code
        status: u16,
        /// Request URL
        url: String,
    },

    /// Every load-balanced server is cooling down
    #[error("No healthy servers available ({servers} configured)")]
    #[diagnostic(
        code(artcache_remote::no_healthy_servers),
        help("Servers recover after the configured cooldown")
    )]
    NoHealthyServers {
        /// Number of configured servers
        servers: usize,
    },

    /// A URL could not be parsed or joined
    #[error("Invalid URL '{url}': {message}")]
    #[diagnostic(code(artcache_remote::invalid_url))]
    InvalidUrl {
        /// Offending URL
        url: String,
        /// Parse error text
        message: String,
    },

    /// A response did not follow the wire format
    #[error("Protocol error: {message}")]
    #[diagnostic(code(artcache_remote::protocol))]
    Protocol {
        /// What was malformed
        message: String,
    },

    /// Local I/O while building or reading a request
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(code(artcache_remote::io))]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path involved, if any
        path: Option<Box<Path>>,
        /// Operation that failed
        operation: String,
    },

    /// JSON encoding or decoding failed
    #[error("Serialization error: {message}")]
    #[diagnostic(code(artcache_remote::serialization))]
    Serialization {
        /// Error text
        message: String,
    },

    /// Retries were exhausted
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    #[diagnostic(code(artcache_remote::retry_exhausted))]
    RetryExhausted {
        /// Operation that was retried
        operation: String,
        /// Attempts made
        attempts: u32,
        /// Last error seen
        last_error: String,
    },

    /// Invalid transport configuration
    #[error("Remote cache configuration error: {0}")]
    #[diagnostic(code(artcache_remote::config))]
    Config(String),
}

impl RemoteError {
    /// Create a connection failure
    #[must_use]
    pub fn connection_failed(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// Create an unexpected status error
    #[must_use]
    pub fn status(status: u16, url: impl Into<String>) -> Self {
        Self::Status {
            status,
            url: url.into(),
        }
    }

    /// Create an invalid URL error
    #[must_use]
    pub fn invalid_url(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a protocol error
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(source: std::io::Error, path: impl AsRef<Path>, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a retry exhaustion error
    #[must_use]
    pub fn retry_exhausted(
        operation: impl Into<String>,
        attempts: u32,
        last_error: impl Into<String>,
    ) -> Self {
        Self::RetryExhausted {
            operation: operation.into(),
            attempts,
            last_error: last_error.into(),
        }
    }

    /// Whether repeating the request could succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. }
            | Self::Timeout { .. }
            | Self::Io { .. }
            | Self::NoHealthyServers { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            Self::InvalidUrl { .. }
            | Self::Protocol { .. }
            | Self::Serialization { .. }
            | Self::RetryExhausted { .. }
            | Self::Config(_) => false,
        }
    }

    /// Map a reqwest error, keeping timeouts distinguishable
    #[must_use]
    pub fn from_reqwest(err: &reqwest::Error, url: &str, timeout_seconds: u64) -> Self {
        if err.is_timeout() {
            Self::timeout(format!("request to {url}"), timeout_seconds)
        } else {
            Self::connection_failed(url, err.to_string())
        }
    }

    /// Convert into a core cache error attributed to `cache`
    #[must_use]
    pub fn into_cache_error(self, cache: &str) -> artcache_core::Error {
        artcache_core::Error::backend(cache, self.to_string())
    }
}

/// Result type for remote operations
pub type Result<T> = std::result::Result<T, RemoteError>;
