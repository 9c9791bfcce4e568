use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced synchronously by the bus API.
///
/// This enum covers the caller-visible error taxonomy: validation failures
/// are returned from `subscribe`/`publish` before an event is admitted,
/// backpressure rejections are returned from `publish` under the `Reject`
/// (or timed-out `Block`) policy, and the remaining variants cover
/// orchestration failures.
#[derive(Debug, Error)]
pub enum BusError {
    /// Topic failed validation (empty, or contains an empty segment)
    #[error("Invalid topic '{0}': topics are non-empty dot-separated segments")]
    InvalidTopic(String),

    /// Pattern failed validation at subscribe time
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The serializer name selected at publish time is not registered
    #[error("No serializer registered under name '{0}'")]
    UnknownSerializer(String),

    /// The event is not known to the bus (already terminal, or never published)
    #[error("Event {0} is not pending on this bus")]
    UnknownEvent(Uuid),

    /// Admission was refused because the bus is at capacity
    #[error("Publish rejected: bus is at capacity ({in_flight}/{limit} in flight)")]
    BackpressureRejected { in_flight: usize, limit: usize },

    /// This node is a replication follower and cannot originate writes
    #[error("Node '{0}' is a follower; only the leader accepts publishes")]
    NotLeader(String),

    /// The durable log or a follower mirror failed
    #[error("Replication error: {0}")]
    Replication(String),

    /// The dispatch loop has shut down
    #[error("Event bus is closed")]
    Closed,

    /// Internal bus error
    #[error("Internal bus error: {0}")]
    Internal(String),
}

/// Type alias for Result with BusError
pub type BusResult<T> = Result<T, BusError>;

/// Errors raised by the transform pipeline (serialize/encrypt and the
/// mirrored decrypt/deserialize). Transform failures are deterministic for a
/// given payload, so they dead-letter the event instead of retrying.
#[derive(Debug, Error, Clone)]
pub enum TransformError {
    /// Payload could not be serialized to wire form
    #[error("Serialization failed: {0}")]
    Serialize(String),

    /// Wire form could not be deserialized back into an event
    #[error("Deserialization failed: {0}")]
    Deserialize(String),

    /// Encryption of the wire form failed
    #[error("Encryption failed: {0}")]
    Encrypt(String),

    /// Decryption of the wire form failed
    #[error("Decryption failed: {0}")]
    Decrypt(String),
}

/// Error returned by a subscriber's handler. A failing handler never affects
/// other handlers or the publisher; the retry engine decides what happens
/// next based on the subscription's retry policy.
#[derive(Debug, Error, Clone)]
#[error("Handler failed: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Type alias for handler outcomes
pub type HandlerResult = Result<(), HandlerError>;
