// Expose the modules
pub mod backpressure;
pub mod bus;
pub mod config;
pub mod dead_letter;
mod dispatcher;
pub mod error;
pub mod event;
pub mod handler;
pub mod registry;
pub mod replication;
pub mod retry;
pub mod topic;
pub mod transform;

// Re-export key types for easier usage
pub use backpressure::{Admission, BackpressureController, OverflowPolicy};
pub use bus::{EventBus, PublishOptions, PublishRequest};
pub use config::BusConfig;
pub use dead_letter::{DeadLetterEntry, DeadLetterReason, DeadLetterSink};
pub use error::{BusError, BusResult, HandlerError, HandlerResult, TransformError};
pub use event::{Disposition, Event, EventContext, SealedEvent};
pub use handler::{EventHandler, handler_fn};
pub use registry::{DispatchMode, SubscribeOptions, SubscriptionRegistry};
pub use replication::{DurableLog, LogEntry, MemoryLog, NodeId, ReplicationCoordinator, Role};
pub use retry::{Backoff, Clock, RetryEngine, RetryPolicy, SystemClock};
pub use topic::Pattern;
pub use transform::{Crypto, JSON_SERIALIZER, Serializer, TransformChain};
