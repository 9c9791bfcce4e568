//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Per-(event, subscription) retry state machine:
//
//   PENDING -> RUNNING -> { SUCCESS | RETRY_SCHEDULED -> RUNNING | EXHAUSTED }
//
// A handler failure either schedules a delayed re-delivery to that handler
// only, or exhausts the pair and hands the event to the dead-letter sink.
// Re-delivery timers are plain tokio tasks and are aborted when the event is
// acknowledged before they fire.
//--------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dispatcher::DispatchCommand;

/// Time source abstraction so retry bookkeeping is testable without real
/// sleeps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Backoff curve for computing re-delivery delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Constant `base_delay` between attempts
    Fixed,
    /// `base_delay * 2^attempt`, capped at `max_delay`
    Exponential,
    /// Uniform random in `[0, exponential delay]`
    Jitter,
}

/// Retry policy attached to a subscription (directly or via a pattern-level
/// default). `max_attempts` counts re-deliveries, so a handler runs at most
/// `max_attempts + 1` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed,
            base_delay,
            max_delay: base_delay,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential,
            base_delay,
            max_delay,
        }
    }

    pub fn jitter(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Jitter,
            base_delay,
            max_delay,
        }
    }

    /// Computes the delay scheduled after a failure of the given attempt
    /// (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => self.exponential_delay(attempt),
            Backoff::Jitter => {
                let cap = self.exponential_delay(attempt);
                let millis = cap.as_millis() as u64;
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
            }
        }
    }

    fn exponential_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Lifecycle of one (event, subscription) delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPhase {
    Pending,
    Running,
    RetryScheduled,
    Succeeded,
    Exhausted,
}

/// Bookkeeping for a pair that has failed at least once.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub event_id: Uuid,
    pub subscription_id: Uuid,
    /// Re-deliveries performed so far
    pub attempt: u32,
    pub next_eligible_at: DateTime<Utc>,
    pub policy: RetryPolicy,
    pub phase: DeliveryPhase,
}

/// What the engine decided about a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// A re-delivery was scheduled after `delay`, as attempt `attempt`
    Scheduled { attempt: u32, delay: Duration },
    /// The pair exhausted its retries; the event goes to the dead-letter sink
    Exhausted,
}

type PairKey = (Uuid, Uuid);

/// Retry engine shared by one bus instance.
pub struct RetryEngine {
    clock: Arc<dyn Clock>,
    states: Mutex<HashMap<PairKey, RetryState>>,
    timers: Mutex<HashMap<PairKey, JoinHandle<()>>>,
}

impl RetryEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            states: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Records that a delivery attempt for the pair is running.
    pub fn on_running(&self, event_id: Uuid, subscription_id: Uuid) {
        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(&(event_id, subscription_id)) {
            state.phase = DeliveryPhase::Running;
        }
    }

    /// Handles a failed delivery attempt: schedules a re-delivery to the same
    /// handler only, or reports exhaustion when `attempt` has reached the
    /// policy's `max_attempts`.
    pub(crate) fn on_failure(
        &self,
        event_id: Uuid,
        subscription_id: Uuid,
        policy: RetryPolicy,
        attempt: u32,
        redeliver_tx: mpsc::Sender<DispatchCommand>,
    ) -> RetryDecision {
        let key = (event_id, subscription_id);

        if attempt >= policy.max_attempts {
            self.states.lock().remove(&key);
            self.timers.lock().remove(&key);
            return RetryDecision::Exhausted;
        }

        let delay = policy.delay_for(attempt);
        let next_attempt = attempt + 1;
        let now = self.clock.now();
        let next_eligible_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        self.states.lock().insert(
            key,
            RetryState {
                event_id,
                subscription_id,
                attempt: next_attempt,
                next_eligible_at,
                policy,
                phase: DeliveryPhase::RetryScheduled,
            },
        );

        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if redeliver_tx
                .send(DispatchCommand::Redeliver {
                    event_id,
                    subscription_id,
                    attempt: next_attempt,
                })
                .await
                .is_err()
            {
                warn!(event_id = %event_id, "dispatch channel closed; dropping scheduled re-delivery");
            }
        });

        // A newer timer for the pair replaces (and aborts) any stale one
        if let Some(stale) = self.timers.lock().insert(key, timer) {
            stale.abort();
        }

        debug!(
            event_id = %event_id,
            subscription_id = %subscription_id,
            attempt = next_attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduled re-delivery"
        );
        RetryDecision::Scheduled {
            attempt: next_attempt,
            delay,
        }
    }

    /// Clears state for a pair that finally succeeded.
    pub fn on_success(&self, event_id: Uuid, subscription_id: Uuid) {
        let key = (event_id, subscription_id);
        self.states.lock().remove(&key);
        if let Some(timer) = self.timers.lock().remove(&key) {
            timer.abort();
        }
    }

    /// Cancels every scheduled re-delivery for an event. Invoked on ack and
    /// on any other terminal transition; a timer that already fired becomes a
    /// no-op because the event is no longer pending.
    pub fn cancel_event(&self, event_id: Uuid) {
        self.states.lock().retain(|key, _| key.0 != event_id);
        let mut timers = self.timers.lock();
        let keys: Vec<PairKey> = timers.keys().filter(|key| key.0 == event_id).copied().collect();
        for key in keys {
            if let Some(timer) = timers.remove(&key) {
                timer.abort();
            }
        }
    }

    /// Snapshot of the retry state for a pair, if it has failed before.
    pub fn state(&self, event_id: Uuid, subscription_id: Uuid) -> Option<RetryState> {
        self.states.lock().get(&(event_id, subscription_id)).cloned()
    }

    /// Number of pairs with a scheduled re-delivery.
    pub fn scheduled_count(&self) -> usize {
        self.timers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RetryEngine {
        RetryEngine::new(Arc::new(SystemClock))
    }

    #[test]
    fn test_fixed_delay_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(40));
        assert_eq!(policy.delay_for(0), Duration::from_millis(40));
        assert_eq!(policy.delay_for(5), Duration::from_millis(40));
    }

    #[test]
    fn test_exponential_delay_doubles_and_caps() {
        let policy =
            RetryPolicy::exponential(5, Duration::from_millis(10), Duration::from_millis(45));
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for(2), Duration::from_millis(40));
        // Capped at max_delay from here on
        assert_eq!(policy.delay_for(3), Duration::from_millis(45));
        assert_eq!(policy.delay_for(30), Duration::from_millis(45));
    }

    #[test]
    fn test_jitter_delay_stays_within_bound() {
        let policy = RetryPolicy::jitter(5, Duration::from_millis(16), Duration::from_secs(1));
        for attempt in 0..4 {
            let cap = Duration::from_millis(16 * 2u64.pow(attempt));
            for _ in 0..50 {
                assert!(policy.delay_for(attempt) <= cap);
            }
        }
    }

    #[tokio::test]
    async fn test_failure_schedules_redelivery_command() {
        let engine = engine();
        let (tx, mut rx) = mpsc::channel(8);
        let event_id = Uuid::new_v4();
        let subscription_id = Uuid::new_v4();
        let policy = RetryPolicy::fixed(2, Duration::from_millis(20));

        let decision = engine.on_failure(event_id, subscription_id, policy, 0, tx);
        assert_eq!(
            decision,
            RetryDecision::Scheduled {
                attempt: 1,
                delay: Duration::from_millis(20)
            }
        );

        let state = engine.state(event_id, subscription_id).unwrap();
        assert_eq!(state.attempt, 1);
        assert_eq!(state.phase, DeliveryPhase::RetryScheduled);

        match rx.recv().await.unwrap() {
            DispatchCommand::Redeliver {
                event_id: ev,
                subscription_id: sub,
                attempt,
            } => {
                assert_eq!(ev, event_id);
                assert_eq!(sub, subscription_id);
                assert_eq!(attempt, 1);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exhaustion_after_max_attempts() {
        let engine = engine();
        let (tx, _rx) = mpsc::channel(8);
        let event_id = Uuid::new_v4();
        let subscription_id = Uuid::new_v4();
        let policy = RetryPolicy::fixed(2, Duration::from_millis(1));

        assert!(matches!(
            engine.on_failure(event_id, subscription_id, policy, 1, tx.clone()),
            RetryDecision::Scheduled { attempt: 2, .. }
        ));
        assert_eq!(
            engine.on_failure(event_id, subscription_id, policy, 2, tx),
            RetryDecision::Exhausted
        );
        assert!(engine.state(event_id, subscription_id).is_none());
    }

    #[tokio::test]
    async fn test_cancel_event_aborts_scheduled_timer() {
        let engine = engine();
        let (tx, mut rx) = mpsc::channel(8);
        let event_id = Uuid::new_v4();
        let policy = RetryPolicy::fixed(3, Duration::from_millis(30));

        engine.on_failure(event_id, Uuid::new_v4(), policy, 0, tx);
        assert_eq!(engine.scheduled_count(), 1);

        engine.cancel_event(event_id);
        assert_eq!(engine.scheduled_count(), 0);

        // The aborted timer never delivers its command
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }
}
