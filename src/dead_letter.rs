use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::event::Event;

/// Machine-readable reason an event was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Serialization or encryption failed; deterministic, never retried
    TransformError,
    /// Evicted by the `DropOldest` backpressure policy
    BackpressureDropped,
    /// A handler exhausted its retry budget
    HandlerExhausted,
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeadLetterReason::TransformError => "transform_error",
            DeadLetterReason::BackpressureDropped => "backpressure_dropped",
            DeadLetterReason::HandlerExhausted => "handler_exhausted",
        };
        f.write_str(name)
    }
}

/// One dead-lettered event. Append-only; entries are never mutated, only
/// removed by an operator-invoked requeue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub event: Event,
    pub reason: DeadLetterReason,
    /// Serializer the event was published with, reused on requeue
    pub serializer: String,
    /// Subscription whose handler exhausted, when applicable
    pub failing_subscription: Option<Uuid>,
    /// Last error message, when one exists
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Terminal store for events that could not be delivered.
pub struct DeadLetterSink {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl DeadLetterSink {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn push(
        &self,
        event: Event,
        reason: DeadLetterReason,
        serializer: impl Into<String>,
        failing_subscription: Option<Uuid>,
        error: Option<String>,
    ) {
        warn!(
            event_id = %event.id,
            topic = %event.topic,
            reason = %reason,
            "event dead-lettered"
        );
        self.entries.lock().push(DeadLetterEntry {
            event,
            reason,
            serializer: serializer.into(),
            failing_subscription,
            error,
            timestamp: Utc::now(),
        });
    }

    /// Snapshot of all entries, oldest first.
    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().clone()
    }

    /// Removes and returns the entry for an event, in support of operator
    /// requeue.
    pub fn take(&self, event_id: Uuid) -> Option<DeadLetterEntry> {
        let mut entries = self.entries.lock();
        let pos = entries.iter().position(|entry| entry.event.id == event_id)?;
        Some(entries.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for DeadLetterSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventContext;
    use serde_json::json;

    fn test_event(topic: &str) -> Event {
        Event::new(topic, json!({"k": 1}), EventContext::new())
    }

    #[test]
    fn test_push_and_snapshot() {
        let sink = DeadLetterSink::new();
        assert!(sink.is_empty());

        sink.push(
            test_event("orders.created"),
            DeadLetterReason::HandlerExhausted,
            "json",
            Some(Uuid::new_v4()),
            Some("boom".to_string()),
        );
        sink.push(
            test_event("orders.cancelled"),
            DeadLetterReason::BackpressureDropped,
            "json",
            None,
            None,
        );

        let entries = sink.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].reason, DeadLetterReason::HandlerExhausted);
        assert_eq!(entries[1].reason, DeadLetterReason::BackpressureDropped);
    }

    #[test]
    fn test_take_removes_entry() {
        let sink = DeadLetterSink::new();
        let event = test_event("orders.created");
        let event_id = event.id;
        sink.push(event, DeadLetterReason::TransformError, "json", None, None);

        let taken = sink.take(event_id).unwrap();
        assert_eq!(taken.event.id, event_id);
        assert_eq!(taken.serializer, "json");
        assert!(sink.is_empty());
        assert!(sink.take(event_id).is_none());
    }

    #[test]
    fn test_reason_display_is_machine_readable() {
        assert_eq!(DeadLetterReason::TransformError.to_string(), "transform_error");
        assert_eq!(
            DeadLetterReason::BackpressureDropped.to_string(),
            "backpressure_dropped"
        );
        assert_eq!(
            DeadLetterReason::HandlerExhausted.to_string(),
            "handler_exhausted"
        );
    }
}
