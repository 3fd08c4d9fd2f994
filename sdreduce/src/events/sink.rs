//! Event sink trait and implementations.

use std::sync::Mutex;
use tracing::{debug, info, Level};

/// Receives structured engine events.
///
/// Implementations must never fail; a sink problem is not allowed to abort
/// a reduction run.
pub trait EventSink: Send + Sync {
    /// Emits an event.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The type of event (e.g., "stage.completed")
    /// * `data` - Optional event payload
    fn emit(&self, event_type: &str, data: Option<serde_json::Value>);
}

/// A no-op event sink that discards all events.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {
        // Intentionally empty - discards all events
    }
}

/// An event sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    /// Creates an info-level logging sink.
    #[must_use]
    pub fn info() -> Self {
        Self::new(Level::INFO)
    }
}

impl EventSink for LoggingEventSink {
    fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        let payload = data.unwrap_or(serde_json::Value::Null);
        if self.level == Level::DEBUG {
            debug!(event = event_type, data = %payload, "pipeline event");
        } else {
            info!(event = event_type, data = %payload, "pipeline event");
        }
    }
}

/// An event sink that records every event, for assertions in tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<(String, Option<serde_json::Value>)>>,
}

impl CollectingEventSink {
    /// Creates an empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<serde_json::Value>)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Returns the recorded event types, in order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .map(|(event_type, _)| event_type)
            .collect()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        if let Ok(mut events) = self.events.lock() {
            events.push((event_type.to_string(), data));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_sink_records_in_order() {
        let sink = CollectingEventSink::new();
        sink.emit("stage.started", Some(serde_json::json!({"stage_id": 1})));
        sink.emit("stage.completed", None);

        assert_eq!(
            sink.event_types(),
            vec!["stage.started".to_string(), "stage.completed".to_string()]
        );
    }

    #[test]
    fn noop_sink_discards() {
        NoOpEventSink.emit("stage.started", None);
    }
}
