//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// The event bus orchestrator. Composes the subscription registry, transform
// chain, backpressure controller, retry engine, dead-letter sink and
// replication coordinator behind one constructible `EventBus` instance (no
// process-wide singletons).
//
// | Component     | Description                                                 |
// |---------------|-------------------------------------------------------------|
// | EventBus      | Public API: publish, subscribe, ack, replication control    |
// | BusCore       | Shared pipeline state driven by the dispatch loop           |
//
//--------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backpressure::{Admission, BackpressureController, OverflowPolicy};
use crate::config::BusConfig;
use crate::dead_letter::{DeadLetterEntry, DeadLetterReason, DeadLetterSink};
use crate::dispatcher::{DispatchCommand, spawn_dispatcher};
use crate::error::{BusError, BusResult, HandlerError, TransformError};
use crate::event::{Disposition, Event, EventContext, SealedEvent};
use crate::handler::{ChannelHandler, EventHandler};
use crate::registry::{DispatchMode, SubscribeOptions, SubscriptionEntry, SubscriptionRegistry};
use crate::replication::{DurableLog, LogEntry, MemoryLog, NodeId, ReplicationCoordinator, Role};
use crate::retry::{RetryDecision, RetryEngine, RetryPolicy, SystemClock};
use crate::topic::validate_topic;
use crate::transform::{Crypto, JSON_SERIALIZER, Serializer, TransformChain};

/// Options accepted at publish time.
#[derive(Clone)]
pub struct PublishOptions {
    /// Explicit context carried on the event; wins over ambient keys
    pub context: EventContext,
    /// Named serializer to use; must be registered
    pub serializer: String,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            context: EventContext::new(),
            serializer: JSON_SERIALIZER.to_string(),
        }
    }
}

/// One element of a `publish_batch` call.
pub struct PublishRequest {
    pub topic: String,
    pub payload: Value,
    pub options: PublishOptions,
}

impl PublishRequest {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            options: PublishOptions::default(),
        }
    }
}

/// An admitted event that has not yet reached a terminal state.
pub(crate) struct PendingEvent {
    sealed: SealedEvent,
    /// Unsealed form, decoded once and shared across all matched handlers
    decoded: OnceLock<Event>,
    /// Handler deliveries still outstanding
    remaining: AtomicUsize,
    /// True once any handler exhausted (or a decode failed)
    any_failed: AtomicBool,
}

/// Shared pipeline state behind the public `EventBus` facade.
pub(crate) struct BusCore {
    node_id: String,
    registry: SubscriptionRegistry,
    transforms: TransformChain,
    backpressure: BackpressureController,
    retry: RetryEngine,
    dead_letters: DeadLetterSink,
    replication: ReplicationCoordinator,
    log: Arc<dyn DurableLog>,
    pending: Mutex<HashMap<Uuid, Arc<PendingEvent>>>,
    command_tx: mpsc::Sender<DispatchCommand>,
}

impl BusCore {
    // ---------------------------------------------------------------- publish

    pub(crate) async fn publish(
        &self,
        topic: &str,
        payload: Value,
        options: PublishOptions,
    ) -> BusResult<Uuid> {
        if !self.replication.is_leader().await {
            return Err(BusError::NotLeader(self.node_id.clone()));
        }
        validate_topic(topic)?;
        if !self.transforms.has_serializer(&options.serializer) {
            return Err(BusError::UnknownSerializer(options.serializer));
        }

        let event = Event::new(topic, payload, options.context);
        let event_id = event.id;

        // Transform chain runs before admission. A failure here is
        // deterministic, so the event dead-letters instead of retrying, and
        // the publisher still gets the event id back.
        let sealed = match self.transforms.seal(event.clone(), &options.serializer) {
            Ok(sealed) => sealed,
            Err(err) => {
                self.dead_letters.push(
                    event,
                    DeadLetterReason::TransformError,
                    options.serializer.clone(),
                    None,
                    Some(err.to_string()),
                );
                self.append_terminal(event_id, topic, Vec::new(), Disposition::DeadLettered)
                    .await;
                return Ok(event_id);
            }
        };

        let pending = Arc::new(PendingEvent {
            sealed,
            decoded: OnceLock::new(),
            remaining: AtomicUsize::new(0),
            any_failed: AtomicBool::new(false),
        });
        // Registered before admission so a concurrent `DropOldest` eviction
        // of this id always finds its target.
        self.pending.lock().insert(event_id, pending);

        match self.backpressure.admit(event_id).await {
            Admission::Admitted => {}
            Admission::AdmittedAfterEviction(evicted) => {
                for old in evicted {
                    self.drop_for_backpressure(old).await;
                }
            }
            Admission::Rejected { in_flight, limit } => {
                self.pending.lock().remove(&event_id);
                debug!(event_id = %event_id, topic, "publish rejected by backpressure");
                return Err(BusError::BackpressureRejected { in_flight, limit });
            }
        }

        if self
            .command_tx
            .send(DispatchCommand::Dispatch { event_id })
            .await
            .is_err()
        {
            self.pending.lock().remove(&event_id);
            self.backpressure.release(event_id);
            return Err(BusError::Closed);
        }

        debug!(event_id = %event_id, topic, "event admitted");
        Ok(event_id)
    }

    // --------------------------------------------------------------- dispatch

    pub(crate) async fn dispatch_event(self: &Arc<Self>, event_id: Uuid) {
        let pending = match self.pending.lock().get(&event_id).cloned() {
            Some(pending) => pending,
            None => {
                // Acked or evicted before dispatch ran; free the slot in case
                // the ack landed while admission was still blocking
                self.backpressure.release(event_id);
                return;
            }
        };

        let decoded = match self.decoded_event(&pending) {
            Ok(event) => event,
            Err(err) => {
                let event = self.event_for_dead_letter(&pending);
                self.dead_letters.push(
                    event,
                    DeadLetterReason::TransformError,
                    pending.sealed.serializer.clone(),
                    None,
                    Some(err.to_string()),
                );
                self.finalize(event_id, Disposition::DeadLettered).await;
                return;
            }
        };

        let matched = self.registry.match_all(&decoded.topic);
        if matched.is_empty() {
            debug!(event_id = %event_id, topic = %decoded.topic, "no subscriptions matched");
            self.finalize(event_id, Disposition::Delivered).await;
            return;
        }

        pending.remaining.store(matched.len(), Ordering::SeqCst);
        debug!(
            event_id = %event_id,
            topic = %decoded.topic,
            handlers = matched.len(),
            "dispatching event"
        );

        // Handlers start in priority order; serial subscriptions are awaited
        // in place, concurrent ones run on their own tasks.
        for entry in matched {
            let event = decoded.clone();
            match entry.mode {
                DispatchMode::Serial => self.deliver(entry, event).await,
                DispatchMode::Concurrent => {
                    let core = Arc::clone(self);
                    tokio::spawn(async move {
                        core.deliver(entry, event).await;
                    });
                }
            }
        }
    }

    pub(crate) async fn redeliver(self: &Arc<Self>, event_id: Uuid, subscription_id: Uuid, attempt: u32) {
        let pending = match self.pending.lock().get(&event_id).cloned() {
            Some(pending) => pending,
            // The event was acked (or otherwise finalized) before the timer
            // fired; the re-delivery is a no-op
            None => return,
        };

        let entry = match self.registry.get(subscription_id) {
            Some(entry) => entry,
            None => {
                // Unsubscribed while the retry was scheduled
                self.retry.on_success(event_id, subscription_id);
                self.complete_one(event_id, false).await;
                return;
            }
        };

        match self.decoded_event(&pending) {
            Ok(mut event) => {
                event.attempt = attempt;
                self.deliver(entry, event).await;
            }
            Err(err) => {
                let event = self.event_for_dead_letter(&pending);
                self.dead_letters.push(
                    event,
                    DeadLetterReason::TransformError,
                    pending.sealed.serializer.clone(),
                    Some(subscription_id),
                    Some(err.to_string()),
                );
                self.complete_one(event_id, true).await;
            }
        }
    }

    /// Runs one handler invocation. The handler executes on its own task so
    /// a panic is contained to this (event, handler) pair.
    async fn deliver(self: &Arc<Self>, entry: SubscriptionEntry, event: Event) {
        let event_id = event.id;
        let attempt = event.attempt;

        if !self.pending.lock().contains_key(&event_id) {
            return;
        }

        self.retry.on_running(event_id, entry.id);

        let handler = Arc::clone(&entry.handler);
        let outcome = tokio::spawn(async move { handler.handle(event).await }).await;
        let result = match outcome {
            Ok(result) => result,
            Err(join_err) => Err(HandlerError::new(format!("handler panicked: {}", join_err))),
        };

        match result {
            Ok(()) => {
                self.retry.on_success(event_id, entry.id);
                self.complete_one(event_id, false).await;
            }
            Err(err) => {
                warn!(
                    event_id = %event_id,
                    subscription_id = %entry.id,
                    attempt,
                    error = %err,
                    "handler failed"
                );
                self.handle_failure(&entry, event_id, attempt, err).await;
            }
        }
    }

    async fn handle_failure(
        self: &Arc<Self>,
        entry: &SubscriptionEntry,
        event_id: Uuid,
        attempt: u32,
        err: HandlerError,
    ) {
        let decision = match self.registry.effective_policy(entry) {
            Some(policy) => {
                self.retry
                    .on_failure(event_id, entry.id, policy, attempt, self.command_tx.clone())
            }
            // No retry policy configured: a single failure exhausts the pair
            None => RetryDecision::Exhausted,
        };

        match decision {
            RetryDecision::Scheduled { .. } => {
                // The event stays pending until the re-delivery resolves
            }
            RetryDecision::Exhausted => {
                if let Some(pending) = self.pending.lock().get(&event_id).cloned() {
                    let mut event = self.event_for_dead_letter(&pending);
                    event.attempt = attempt;
                    self.dead_letters.push(
                        event,
                        DeadLetterReason::HandlerExhausted,
                        pending.sealed.serializer.clone(),
                        Some(entry.id),
                        Some(err.to_string()),
                    );
                }
                self.complete_one(event_id, true).await;
            }
        }
    }

    // ------------------------------------------------------------ completion

    async fn complete_one(&self, event_id: Uuid, failed: bool) {
        let pending = match self.pending.lock().get(&event_id).cloned() {
            Some(pending) => pending,
            None => return,
        };

        if failed {
            pending.any_failed.store(true, Ordering::SeqCst);
        }

        if pending.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            let disposition = if pending.any_failed.load(Ordering::SeqCst) {
                Disposition::DeadLettered
            } else {
                Disposition::Delivered
            };
            self.finalize(event_id, disposition).await;
        }
    }

    /// Moves an event to a terminal state: exactly one durable-log append,
    /// which happens before any replication push. Idempotent.
    async fn finalize(&self, event_id: Uuid, disposition: Disposition) {
        let pending = match self.pending.lock().remove(&event_id) {
            Some(pending) => pending,
            None => return,
        };

        self.retry.cancel_event(event_id);
        self.backpressure.release(event_id);
        debug!(event_id = %event_id, ?disposition, "event reached terminal state");

        self.append_terminal(
            event_id,
            &pending.sealed.topic,
            pending.sealed.wire.clone(),
            disposition,
        )
        .await;
    }

    async fn append_terminal(
        &self,
        event_id: Uuid,
        topic: &str,
        wire: Vec<u8>,
        disposition: Disposition,
    ) {
        let entry = LogEntry {
            offset: 0,
            event_id,
            topic: topic.to_string(),
            wire,
            disposition,
            recorded_at: Utc::now(),
        };

        match self.log.append(entry).await {
            Ok(offset) => {
                debug!(event_id = %event_id, offset, ?disposition, "appended terminal event to log");
                if let Err(err) = self.replication.replicate().await {
                    warn!(error = %err, "replication push failed");
                }
            }
            Err(err) => {
                error!(event_id = %event_id, error = %err, "durable log append failed");
            }
        }
    }

    pub(crate) async fn ack(&self, event_id: Uuid) {
        // Idempotent: a second ack finds nothing pending
        self.retry.cancel_event(event_id);
        self.finalize(event_id, Disposition::Acked).await;
    }

    async fn drop_for_backpressure(&self, event_id: Uuid) {
        let pending = match self.pending.lock().remove(&event_id) {
            Some(pending) => pending,
            None => return,
        };

        self.retry.cancel_event(event_id);
        let event = self.event_for_dead_letter(&pending);
        self.dead_letters.push(
            event,
            DeadLetterReason::BackpressureDropped,
            pending.sealed.serializer.clone(),
            None,
            None,
        );
        self.append_terminal(
            event_id,
            &pending.sealed.topic,
            pending.sealed.wire.clone(),
            Disposition::DeadLettered,
        )
        .await;
    }

    // --------------------------------------------------------------- helpers

    fn decoded_event(&self, pending: &PendingEvent) -> Result<Event, TransformError> {
        if let Some(event) = pending.decoded.get() {
            return Ok(event.clone());
        }
        let event = self.transforms.unseal(&pending.sealed)?;
        // A concurrent decode of the same event produces an identical value
        let _ = pending.decoded.set(event.clone());
        Ok(event)
    }

    fn event_for_dead_letter(&self, pending: &PendingEvent) -> Event {
        self.decoded_event(pending).unwrap_or_else(|_| Event {
            id: pending.sealed.event_id,
            topic: pending.sealed.topic.clone(),
            payload: Value::Null,
            created_at: Utc::now(),
            context: EventContext::new(),
            attempt: 0,
        })
    }
}

/// In-process publish/subscribe event bus with wildcard topic matching,
/// at-least-once delivery and leader-based replication of the durable log.
pub struct EventBus {
    core: Arc<BusCore>,
    dispatcher: JoinHandle<()>,
}

impl EventBus {
    /// Creates a bus with an in-memory durable log.
    pub fn new(config: BusConfig) -> Self {
        Self::with_log(config, Arc::new(MemoryLog::new()))
    }

    /// Creates a bus over a caller-supplied durable log backend.
    pub fn with_log(config: BusConfig, log: Arc<dyn DurableLog>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(config.dispatch_buffer.max(1));

        let core = Arc::new(BusCore {
            node_id: config.node_id.clone(),
            registry: SubscriptionRegistry::new(),
            transforms: TransformChain::new(config.ambient_context),
            backpressure: BackpressureController::new(
                config.max_in_flight,
                config.overflow_policy,
                config.block_timeout,
            ),
            retry: RetryEngine::new(Arc::new(SystemClock)),
            dead_letters: DeadLetterSink::new(),
            replication: ReplicationCoordinator::new(config.node_id.clone(), log.clone()),
            log,
            pending: Mutex::new(HashMap::new()),
            command_tx,
        });

        let dispatcher = spawn_dispatcher(Arc::clone(&core), command_rx);
        info!(node_id = %config.node_id, "event bus created");

        Self { core, dispatcher }
    }

    // ------------------------------------------------------------- publish

    /// Publishes an event with default options. Returns the event id, or a
    /// rejection when the bus is at capacity under the `Reject` policy.
    pub async fn publish(&self, topic: &str, payload: Value) -> BusResult<Uuid> {
        self.core.publish(topic, payload, PublishOptions::default()).await
    }

    /// Publishes with explicit context and/or serializer selection.
    pub async fn publish_with(
        &self,
        topic: &str,
        payload: Value,
        options: PublishOptions,
    ) -> BusResult<Uuid> {
        self.core.publish(topic, payload, options).await
    }

    /// Publishes a batch in order. Each element is admitted independently,
    /// so a rejection partway through does not undo earlier publishes.
    pub async fn publish_batch(&self, requests: Vec<PublishRequest>) -> Vec<BusResult<Uuid>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(
                self.core
                    .publish(&request.topic, request.payload, request.options)
                    .await,
            );
        }
        results
    }

    /// Acknowledges an event: cancels any scheduled re-deliveries and
    /// finalizes it. Idempotent; acking an unknown event is a no-op.
    pub async fn ack(&self, event_id: Uuid) {
        self.core.ack(event_id).await;
    }

    /// Republishes a dead-lettered event as a fresh event with `attempt` 0,
    /// removing the dead-letter entry.
    pub async fn requeue(&self, event_id: Uuid) -> BusResult<Uuid> {
        let entry = self
            .core
            .dead_letters
            .take(event_id)
            .ok_or(BusError::UnknownEvent(event_id))?;

        let options = PublishOptions {
            context: entry.event.context.clone(),
            serializer: entry.serializer.clone(),
        };
        self.core
            .publish(&entry.event.topic, entry.event.payload.clone(), options)
            .await
    }

    // ----------------------------------------------------------- subscribe

    /// Registers a handler with default priority and mode.
    pub fn subscribe(&self, pattern: &str, handler: Arc<dyn EventHandler>) -> BusResult<Uuid> {
        self.core
            .registry
            .subscribe(pattern, handler, SubscribeOptions::default())
    }

    /// Registers a handler with explicit priority, dispatch mode and retry
    /// policy.
    pub fn subscribe_with(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> BusResult<Uuid> {
        self.core.registry.subscribe(pattern, handler, options)
    }

    /// Registers a channel-backed subscription for synchronous consumers.
    /// Decoded events arrive on the returned receiver.
    pub fn subscribe_channel(
        &self,
        pattern: &str,
        options: SubscribeOptions,
    ) -> BusResult<(Uuid, crossbeam_channel::Receiver<Event>)> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let id = self.core.registry.subscribe(
            pattern,
            Arc::new(ChannelHandler::new(sender)),
            options,
        )?;
        Ok((id, receiver))
    }

    /// Removes a subscription. Unknown ids are a no-op.
    pub fn unsubscribe(&self, subscription_id: Uuid) -> bool {
        self.core.registry.unsubscribe(subscription_id)
    }

    // --------------------------------------------------------------- tuning

    /// Installs a retry policy for every subscription registered under the
    /// exact pattern, current and future.
    pub fn set_retry_policy(&self, pattern: &str, policy: RetryPolicy) -> BusResult<()> {
        self.core.registry.set_retry_policy(pattern, policy)
    }

    /// Replaces the backpressure limit and policy at runtime.
    pub fn apply_backpressure(&self, limit: usize, policy: OverflowPolicy) {
        self.core.backpressure.apply(limit, policy);
    }

    /// Registers a serializer plugin under a name.
    pub fn register_serializer(&self, name: impl Into<String>, serializer: Arc<dyn Serializer>) {
        self.core.transforms.register_serializer(name, serializer);
    }

    /// Replaces the crypto module (identity by default).
    pub fn register_crypto(&self, crypto: Arc<dyn Crypto>) {
        self.core.transforms.register_crypto(crypto);
    }

    /// Adds an ambient context value merged into every published event.
    pub fn set_context(&self, key: impl Into<String>, value: impl Into<String>) {
        self.core.transforms.set_context(key, value);
    }

    // ---------------------------------------------------------- replication

    /// Installs a cluster membership view; the first node is the leader.
    pub async fn cluster_deploy(&self, nodes: Vec<NodeId>) -> BusResult<()> {
        self.core.replication.cluster_deploy(nodes).await
    }

    /// Supplies a log backend for a peer ahead of `cluster_deploy`.
    pub async fn attach_peer(&self, node: NodeId, log: Arc<dyn DurableLog>) {
        self.core.replication.attach_peer(node, log).await;
    }

    /// Returns local durable-log entries at or after `from_offset`.
    pub async fn persist_and_replay(&self, from_offset: u64) -> BusResult<Vec<LogEntry>> {
        self.core.replication.replay(from_offset).await
    }

    /// Returns a follower mirror's entries at or after `from_offset`.
    pub async fn replay_follower(&self, node: &str, from_offset: u64) -> BusResult<Vec<LogEntry>> {
        self.core.replication.replay_peer(node, from_offset).await
    }

    pub async fn role(&self) -> Role {
        self.core.replication.role().await
    }

    // ------------------------------------------------------- introspection

    /// Snapshot of the dead-letter queue, oldest first.
    pub fn dead_letter_queue(&self) -> Vec<DeadLetterEntry> {
        self.core.dead_letters.entries()
    }

    /// Number of admitted-but-not-terminal events.
    pub fn in_flight(&self) -> usize {
        self.core.backpressure.in_flight()
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.core.registry.len()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}
