use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::debug;

use crate::error::{HandlerError, HandlerResult};
use crate::event::Event;

/// Event handler trait for processing delivered events.
///
/// A handler returning `Err` is retried according to the subscription's
/// retry policy; failures never propagate to the publisher or to other
/// subscribers.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Processes one delivery of an event. `event.attempt` reflects how many
    /// re-deliveries preceded this invocation.
    async fn handle(&self, event: Event) -> HandlerResult;
}

/// Bridges deliveries into a crossbeam channel so synchronous consumers can
/// pull decoded events off the bus with `Receiver::recv`.
pub(crate) struct ChannelHandler {
    sender: Sender<Event>,
}

impl ChannelHandler {
    pub(crate) fn new(sender: Sender<Event>) -> Self {
        Self { sender }
    }
}

#[async_trait::async_trait]
impl EventHandler for ChannelHandler {
    async fn handle(&self, event: Event) -> HandlerResult {
        debug!(event_id = %event.id, topic = %event.topic, "forwarding event to channel subscriber");
        self.sender
            .send(event)
            .map_err(|_| HandlerError::new("channel subscriber disconnected"))
    }
}

struct FnHandler<F> {
    func: F,
}

#[async_trait::async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> HandlerResult + Send + Sync,
{
    async fn handle(&self, event: Event) -> HandlerResult {
        (self.func)(event)
    }
}

/// Wraps a synchronous closure as an `EventHandler`.
pub fn handler_fn<F>(func: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(FnHandler { func })
}
