use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Propagated key/value context carried on every event. Ordered so that
/// serialized form is deterministic.
pub type EventContext = BTreeMap<String, String>;

/// An event flowing through the bus.
///
/// Created by the publisher and immutable afterwards, except for `attempt`,
/// which reflects how many re-deliveries preceded the current invocation of a
/// handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Unique identifier assigned at publish time
    pub id: Uuid,
    /// Dot-segmented subject of the event
    pub topic: String,
    /// Structured payload; serializers turn this into wire form
    pub payload: Value,
    /// Timestamp when the event was created
    pub created_at: DateTime<Utc>,
    /// Propagated context; explicit publish-time values win over ambient ones
    pub context: EventContext,
    /// Re-delivery count for the current handler invocation (0 on first try)
    pub attempt: u32,
}

impl Event {
    /// Creates a fresh event with a new id and zero attempts.
    pub fn new(topic: impl Into<String>, payload: Value, context: EventContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            created_at: Utc::now(),
            context,
            attempt: 0,
        }
    }
}

/// Wire form of an event after the transform chain ran: context injection,
/// then serialization with the named serializer, then encryption.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SealedEvent {
    /// Id of the sealed event
    pub event_id: Uuid,
    /// Topic, kept in the clear for subscription matching
    pub topic: String,
    /// Name of the serializer that produced `wire`
    pub serializer: String,
    /// Encrypted wire bytes
    pub wire: Vec<u8>,
}

/// Terminal state of an event, recorded exactly once in the durable log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Every matched handler succeeded (possibly after retries)
    Delivered,
    /// The event was dead-lettered (transform failure, backpressure drop, or
    /// at least one handler exhausted its retries)
    DeadLettered,
    /// The publisher acknowledged the event before delivery completed
    Acked,
}
