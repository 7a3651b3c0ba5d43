//! The sink abstraction caches report events through.

use crate::event::CacheEvent;
use std::sync::Arc;

/// Fire-and-forget destination for cache events.
///
/// Implementations must never block and must never fail the caller.
pub trait EventSink: Send + Sync {
    /// Deliver an event.
    fn emit(&self, event: CacheEvent);
}

/// Sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: CacheEvent) {}
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn emit(&self, event: CacheEvent) {
        (**self).emit(event);
    }
}

/// Shared handle to an event sink.
pub type SharedEventSink = Arc<dyn EventSink>;

/// Convenience constructor for a shared no-op sink.
#[must_use]
pub fn noop_sink() -> SharedEventSink {
    Arc::new(NoopEventSink)
}

/// Sink that records every event, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: std::sync::Mutex<Vec<CacheEvent>>,
}

impl RecordingEventSink {
    /// Create an empty recording sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event received so far.
    #[must_use]
    pub fn events(&self) -> Vec<CacheEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: CacheEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventCategory;

    #[test]
    fn test_recording_sink_keeps_events() {
        let sink = RecordingEventSink::new();
        sink.emit(CacheEvent::warning("remote cache disabled"));
        sink.emit(CacheEvent::new(EventCategory::Shutdown));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0].category,
            EventCategory::Warning { message } if message == "remote cache disabled"
        ));
    }

    #[test]
    fn test_noop_sink_through_arc() {
        let sink = noop_sink();
        sink.emit(CacheEvent::new(EventCategory::Shutdown));
    }
}
