//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Owns the mapping from wildcard pattern to handlers. Registration and
// lookups share a reader-biased lock: concurrent publishes match in parallel
// while subscribe/unsubscribe take the write side. Matched handlers are
// returned in descending priority order, ties broken by registration order.
//--------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::BusResult;
use crate::handler::EventHandler;
use crate::retry::RetryPolicy;
use crate::topic::{DELIMITER, Pattern};

/// Whether handlers for the same event may run concurrently with the rest of
/// the matched set, or must be awaited in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    #[default]
    Concurrent,
    Serial,
}

/// Options accepted at subscribe time.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Higher priorities are dispatched first
    pub priority: i32,
    pub mode: DispatchMode,
    /// Retry policy for this subscription; falls back to the pattern-level
    /// policy installed via `set_retry_policy`, then to no retries
    pub retry_policy: Option<RetryPolicy>,
}

/// One registered subscription.
#[derive(Clone)]
pub struct SubscriptionEntry {
    pub id: Uuid,
    pub pattern: Pattern,
    pub handler: Arc<dyn EventHandler>,
    pub priority: i32,
    pub mode: DispatchMode,
    pub retry_policy: Option<RetryPolicy>,
    pub registered_at: DateTime<Utc>,
    seq: u64,
}

struct RegistryInner {
    subscriptions: HashMap<Uuid, SubscriptionEntry>,
    pattern_policies: HashMap<String, RetryPolicy>,
}

/// Thread-safe subscription table.
pub struct SubscriptionRegistry {
    inner: RwLock<RegistryInner>,
    // Registration order, used as the stable tie-break within a priority
    seq: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                subscriptions: HashMap::new(),
                pattern_policies: HashMap::new(),
            }),
            seq: AtomicU64::new(0),
        }
    }

    /// Registers a handler under a pattern.
    ///
    /// # Errors
    /// Returns `BusError::InvalidPattern` when the pattern is malformed;
    /// validation happens here so publish-time matching can never fail.
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> BusResult<Uuid> {
        let pattern = Pattern::parse(pattern)?;
        let id = Uuid::new_v4();
        let entry = SubscriptionEntry {
            id,
            pattern,
            handler,
            priority: options.priority,
            mode: options.mode,
            retry_policy: options.retry_policy,
            registered_at: Utc::now(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
        };

        debug!(subscription_id = %id, pattern = %entry.pattern, priority = entry.priority, "registered subscription");
        self.inner.write().subscriptions.insert(id, entry);
        Ok(id)
    }

    /// Removes a subscription. Unknown ids are a no-op (idempotent).
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let removed = self.inner.write().subscriptions.remove(&id).is_some();
        if removed {
            debug!(subscription_id = %id, "removed subscription");
        }
        removed
    }

    /// Looks up one subscription by id.
    pub fn get(&self, id: Uuid) -> Option<SubscriptionEntry> {
        self.inner.read().subscriptions.get(&id).cloned()
    }

    /// Returns every subscription matching the topic, ordered by priority
    /// descending with registration order as the stable tie-break.
    pub fn match_all(&self, topic: &str) -> Vec<SubscriptionEntry> {
        // Pre-split once and reuse across every pattern
        let segments: Vec<&str> = topic.split(DELIMITER).collect();

        let inner = self.inner.read();
        let mut matched: Vec<SubscriptionEntry> = inner
            .subscriptions
            .values()
            .filter(|entry| entry.pattern.matches_segments(&segments))
            .cloned()
            .collect();
        drop(inner);

        matched.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        matched
    }

    /// Installs a retry policy for every subscription whose pattern text
    /// equals `pattern`, current and future.
    pub fn set_retry_policy(&self, pattern: &str, policy: RetryPolicy) -> BusResult<()> {
        let pattern = Pattern::parse(pattern)?;
        self.inner
            .write()
            .pattern_policies
            .insert(pattern.text().to_string(), policy);
        Ok(())
    }

    /// Resolves the retry policy in effect for a subscription: its own
    /// policy first, then the pattern-level one.
    pub fn effective_policy(&self, entry: &SubscriptionEntry) -> Option<RetryPolicy> {
        if entry.retry_policy.is_some() {
            return entry.retry_policy;
        }
        self.inner
            .read()
            .pattern_policies
            .get(entry.pattern.text())
            .copied()
    }

    /// Returns the number of active subscriptions.
    pub fn len(&self) -> usize {
        self.inner.read().subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
