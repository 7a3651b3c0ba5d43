//! Event type definitions for the artifact cache.
//!
//! Events are fire-and-forget notifications used for observability: connection
//! lifecycle, per-request transfer sizes and fetch/store outcomes. Nothing in
//! the cache depends on an event being delivered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A cache event with identity and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEvent {
    /// Unique event identifier.
    pub id: Uuid,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// The event category and data.
    pub category: EventCategory,
}

impl CacheEvent {
    /// Create a new event with the given category.
    #[must_use]
    pub fn new(category: EventCategory) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            category,
        }
    }

    /// Shorthand for a connection-started event.
    #[must_use]
    pub fn connect_started() -> Self {
        Self::new(EventCategory::Connect(ConnectEvent::Started))
    }

    /// Shorthand for a connection-finished event.
    #[must_use]
    pub fn connect_finished(duration_ms: u64) -> Self {
        Self::new(EventCategory::Connect(ConnectEvent::Finished { duration_ms }))
    }

    /// Shorthand for a user-visible warning.
    #[must_use]
    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(EventCategory::Warning {
            message: message.into(),
        })
    }
}

/// Event categories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventCategory {
    /// Cache graph construction lifecycle.
    Connect(ConnectEvent),
    /// A fetch finished with the given outcome.
    Fetch(FetchEvent),
    /// A store finished.
    Store(StoreEvent),
    /// Bytes were received from a remote cache.
    BytesReceived {
        /// Number of bytes in this chunk.
        bytes: u64,
    },
    /// Something the user should see once, e.g. a disabled remote cache.
    Warning {
        /// Human readable message.
        message: String,
    },
    /// The cache graph is shutting down.
    Shutdown,
}

/// Cache construction events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ConnectEvent {
    /// Construction of a cache instance started.
    Started,
    /// Construction of a cache instance finished.
    Finished {
        /// Elapsed time in milliseconds.
        duration_ms: u64,
    },
}

/// Outcome of a single fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchEvent {
    /// Name of the cache tier that handled the request.
    pub cache: String,
    /// Hex encoding of the rule key.
    pub rule_key: String,
    /// Build target the fetch was issued for, if known.
    pub target: Option<String>,
    /// Outcome name (`hit`, `miss`, `error`, ...).
    pub outcome: String,
    /// Payload size for hits.
    pub artifact_size: Option<u64>,
    /// Error text for failed fetches.
    pub error: Option<String>,
}

/// Outcome of a single store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEvent {
    /// Name of the cache tier that handled the request.
    pub cache: String,
    /// Hex encodings of the rule keys the artifact was stored under.
    pub rule_keys: Vec<String>,
    /// Payload size in bytes, if known.
    pub artifact_size: Option<u64>,
    /// Whether the store succeeded.
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = CacheEvent::new(EventCategory::BytesReceived { bytes: 42 });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["category"]["type"], "BytesReceived");
        assert_eq!(json["category"]["data"]["bytes"], 42);
    }

    #[test]
    fn test_connect_finished_roundtrip() {
        let event = CacheEvent::connect_finished(17);
        let json = serde_json::to_string(&event).unwrap();
        let back: CacheEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, event.id);
        assert!(matches!(
            back.category,
            EventCategory::Connect(ConnectEvent::Finished { duration_ms: 17 })
        ));
    }
}
