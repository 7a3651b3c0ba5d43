//! Structured events for the artcache artifact cache.
//!
//! Caches report what they do through an [`EventSink`]. The sink is optional
//! in spirit: every cache works with [`NoopEventSink`], and
//! [`RecordingEventSink`] keeps every event for later inspection.
//!
//! Alongside the typed events, the `emit_*` macros log the same facts through
//! `tracing` with a stable `event_type` field so log pipelines can filter on
//! them.
//!
//! # Usage
//!
//! ```rust,ignore
//! use artcache_events::{CacheEvent, EventSink, RecordingEventSink};
//!
//! let sink = RecordingEventSink::new();
//! sink.emit(CacheEvent::warning("remote cache disabled"));
//! assert_eq!(sink.events().len(), 1);
//! ```

pub mod event;
pub mod sink;

pub use event::{CacheEvent, ConnectEvent, EventCategory, FetchEvent, StoreEvent};
pub use sink::{EventSink, NoopEventSink, RecordingEventSink, SharedEventSink, noop_sink};

/// Emit a cache hit event.
///
/// # Example
/// ```rust,ignore
/// emit_cache_hit!("dir", "deadbeef", 5);
/// ```
#[macro_export]
macro_rules! emit_cache_hit {
    ($cache:expr, $rule_key:expr, $size:expr) => {
        ::tracing::debug!(
            target: "artcache::fetch",
            event_type = "cache.hit",
            cache = %$cache,
            rule_key = %$rule_key,
            artifact_size = ?$size,
        )
    };
}

/// Emit a cache miss event.
#[macro_export]
macro_rules! emit_cache_miss {
    ($cache:expr, $rule_key:expr) => {
        ::tracing::debug!(
            target: "artcache::fetch",
            event_type = "cache.miss",
            cache = %$cache,
            rule_key = %$rule_key,
        )
    };
}

/// Emit a cache error event.
///
/// Per-key errors are logged at debug level; persistent failures are reported
/// once as a warning by the caller.
#[macro_export]
macro_rules! emit_cache_error {
    ($cache:expr, $rule_key:expr, $error:expr) => {
        ::tracing::debug!(
            target: "artcache::fetch",
            event_type = "cache.error",
            cache = %$cache,
            rule_key = %$rule_key,
            error = %$error,
        )
    };
}

/// Emit a store finished event.
#[macro_export]
macro_rules! emit_store_finished {
    ($cache:expr, $rule_keys:expr, $success:expr) => {
        ::tracing::debug!(
            target: "artcache::store",
            event_type = "cache.store",
            cache = %$cache,
            rule_keys = ?$rule_keys,
            success = $success,
        )
    };
}
