//! Telemetry sink for named lifecycle events.
//!
//! Components report noteworthy events (tool replaced, module stopped after a
//! timeout, session expired, ...) through the [`Telemetry`] trait instead of
//! logging directly, so embedders can route them elsewhere. The default sink
//! forwards them to `tracing`.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

/// A structured event sink.
pub trait Telemetry: Send + Sync {
    /// Records a named event with a JSON payload.
    fn event(&self, name: &str, data: Value);
}

/// Emits every event as a `tracing` info event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn event(&self, name: &str, data: Value) {
        tracing::info!(event = name, data = %data, "telemetry");
    }
}

/// Keeps every event in memory. Useful for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<(String, Value)>>,
}

impl RecordingTelemetry {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns a copy of all recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Value)> {
        self.events.lock().clone()
    }

    /// Returns the payloads of all events with the given name.
    #[must_use]
    pub fn named(&self, name: &str) -> Vec<Value> {
        self.events
            .lock()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, data)| data.clone())
            .collect()
    }
}

impl Telemetry for RecordingTelemetry {
    fn event(&self, name: &str, data: Value) {
        self.events.lock().push((name.to_string(), data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recorder_filters_by_name() {
        let recorder = RecordingTelemetry::new();
        recorder.event("a", json!(1));
        recorder.event("b", json!(2));
        recorder.event("a", json!(3));

        assert_eq!(recorder.events().len(), 3);
        assert_eq!(recorder.named("a"), vec![json!(1), json!(3)]);
    }
}
