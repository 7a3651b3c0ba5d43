//! Error types for the artifact cache

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for artifact cache operations.
///
/// Fetch outcomes are never reported through this type: misses and fetch
/// failures are values of [`crate::CacheResult`]. Errors surface from stores,
/// deletes, construction and configuration.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(artcache::io),
        help("Check file permissions and free disk space")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "rename")
        operation: String,
    },

    /// Configuration or construction precondition failure
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(artcache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Invalid rule key, content key or digest
    #[error("Invalid key: {message}")]
    #[diagnostic(code(artcache::invalid_key))]
    InvalidKey {
        /// What was wrong with the key
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(artcache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// Error reported by a backing cache
    #[error("{cache} cache error: {message}")]
    #[diagnostic(code(artcache::backend))]
    Backend {
        /// Name of the cache that failed
        cache: String,
        /// Error message from the cache
        message: String,
    },

    /// SQLite error
    #[error("SQLite {operation} failed")]
    #[diagnostic(code(artcache::sqlite))]
    Sqlite {
        /// The underlying SQLite error
        #[source]
        source: rusqlite::Error,
        /// Operation that failed
        operation: String,
    },

    /// Stores to one or more caches failed
    #[error("{} store(s) failed: {}", failures.len(), failures.join("; "))]
    #[diagnostic(code(artcache::store_failed))]
    StoreFailed {
        /// One message per failed store
        failures: Vec<String>,
    },

    /// A background task panicked or was cancelled
    #[error("Background {operation} task did not complete: {message}")]
    #[diagnostic(code(artcache::task))]
    Task {
        /// What the task was doing
        operation: String,
        /// Join error text
        message: String,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
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

    /// Create an invalid key error
    #[must_use]
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a backend error
    #[must_use]
    pub fn backend(cache: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Backend {
            cache: cache.into(),
            message: msg.into(),
        }
    }

    /// Create a SQLite error
    #[must_use]
    pub fn sqlite(source: rusqlite::Error, operation: impl Into<String>) -> Self {
        Self::Sqlite {
            source,
            operation: operation.into(),
        }
    }

    /// Create an error for a background task that failed to join
    #[must_use]
    pub fn task(operation: impl Into<String>, err: &tokio::task::JoinError) -> Self {
        Self::Task {
            operation: operation.into(),
            message: err.to_string(),
        }
    }
}

/// Result type for artifact cache operations
pub type Result<T> = std::result::Result<T, Error>;
