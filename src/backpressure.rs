//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Bounded admission control in front of dispatch. The controller counts
// admitted-but-not-terminal events; at capacity the configured policy
// decides whether a publish is rejected, an older event is evicted, or the
// caller waits (bounded by a timeout) for a slot. Configuration is mutable
// at runtime and a capacity reduction never evicts already-admitted events.
//--------------------------------------------------------------------------------------------------

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

/// Policy applied when a publish arrives with the bus at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Refuse the new event synchronously; the caller decides what to do
    Reject,
    /// Evict the oldest in-flight event (dead-lettered as dropped) to make
    /// room for the new one
    DropOldest,
    /// Suspend the publish until a slot frees up or the timeout elapses,
    /// then behave like `Reject`
    Block,
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Admitted after evicting these events; the bus dead-letters them
    AdmittedAfterEviction(Vec<Uuid>),
    Rejected { in_flight: usize, limit: usize },
}

struct BackpressureInner {
    limit: usize,
    policy: OverflowPolicy,
    block_timeout: Duration,
    // Admission order, oldest first; eviction pops from the front
    in_flight: VecDeque<Uuid>,
}

/// Bounded in-flight event counter for one bus instance.
pub struct BackpressureController {
    inner: Mutex<BackpressureInner>,
    released: Notify,
}

impl BackpressureController {
    pub fn new(limit: usize, policy: OverflowPolicy, block_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BackpressureInner {
                limit,
                policy,
                block_timeout,
                in_flight: VecDeque::new(),
            }),
            released: Notify::new(),
        }
    }

    /// Replaces limit and policy at runtime. Already-admitted events are
    /// never evicted by a capacity reduction.
    pub fn apply(&self, limit: usize, policy: OverflowPolicy) {
        let mut inner = self.inner.lock();
        inner.limit = limit;
        inner.policy = policy;
        debug!(limit, ?policy, "backpressure configuration updated");
        // A raised limit may unblock waiting publishers
        self.released.notify_waiters();
    }

    /// Attempts to admit an event, applying the overflow policy at capacity.
    /// Only the `Block` policy suspends, bounded by the configured timeout.
    pub async fn admit(&self, event_id: Uuid) -> Admission {
        loop {
            // Register for release notifications before the capacity check so
            // a release between the check and the await is not missed
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let timeout = {
                let mut inner = self.inner.lock();
                if inner.in_flight.len() < inner.limit {
                    inner.in_flight.push_back(event_id);
                    return Admission::Admitted;
                }

                match inner.policy {
                    OverflowPolicy::Reject => {
                        return Admission::Rejected {
                            in_flight: inner.in_flight.len(),
                            limit: inner.limit,
                        };
                    }
                    OverflowPolicy::DropOldest => {
                        let mut evicted = Vec::new();
                        // Evict until one slot is free (limit may have shrunk)
                        while inner.in_flight.len() >= inner.limit.max(1) {
                            match inner.in_flight.pop_front() {
                                Some(old) => evicted.push(old),
                                None => break,
                            }
                        }
                        inner.in_flight.push_back(event_id);
                        warn!(count = evicted.len(), "evicted oldest in-flight events to admit publish");
                        return Admission::AdmittedAfterEviction(evicted);
                    }
                    OverflowPolicy::Block => inner.block_timeout,
                }
            };

            // Block policy: wait for a release or time out into a rejection
            if tokio::time::timeout(timeout, notified).await.is_err() {
                let inner = self.inner.lock();
                if inner.in_flight.len() < inner.limit {
                    // A slot freed right at the deadline; loop to claim it
                    continue;
                }
                return Admission::Rejected {
                    in_flight: inner.in_flight.len(),
                    limit: inner.limit,
                };
            }
        }
    }

    /// Releases an event's slot once it reaches a terminal state. Idempotent:
    /// releasing an evicted or already-released event is a no-op.
    pub fn release(&self, event_id: Uuid) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.in_flight.iter().position(|id| *id == event_id) {
            inner.in_flight.remove(pos);
            drop(inner);
            self.released.notify_waiters();
        }
    }

    /// Number of admitted-but-not-terminal events.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(limit: usize, policy: OverflowPolicy) -> BackpressureController {
        BackpressureController::new(limit, policy, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_reject_at_capacity() {
        let ctrl = controller(1, OverflowPolicy::Reject);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert_eq!(ctrl.admit(first).await, Admission::Admitted);
        assert!(matches!(
            ctrl.admit(second).await,
            Admission::Rejected { in_flight: 1, limit: 1 }
        ));

        // Releasing frees the slot
        ctrl.release(first);
        assert_eq!(ctrl.admit(second).await, Admission::Admitted);
    }

    #[tokio::test]
    async fn test_drop_oldest_evicts_in_admission_order() {
        let ctrl = controller(1, OverflowPolicy::DropOldest);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert_eq!(ctrl.admit(first).await, Admission::Admitted);
        match ctrl.admit(second).await {
            Admission::AdmittedAfterEviction(evicted) => assert_eq!(evicted, vec![first]),
            other => panic!("unexpected admission: {:?}", other),
        }
        assert_eq!(ctrl.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_block_times_out_into_rejection() {
        let ctrl = controller(1, OverflowPolicy::Block);
        ctrl.admit(Uuid::new_v4()).await;

        let started = std::time::Instant::now();
        let admission = ctrl.admit(Uuid::new_v4()).await;
        assert!(matches!(admission, Admission::Rejected { .. }));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_block_wakes_on_release() {
        let ctrl = std::sync::Arc::new(BackpressureController::new(
            1,
            OverflowPolicy::Block,
            Duration::from_secs(2),
        ));
        let first = Uuid::new_v4();
        ctrl.admit(first).await;

        let waiter = {
            let ctrl = ctrl.clone();
            tokio::spawn(async move { ctrl.admit(Uuid::new_v4()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        ctrl.release(first);

        let admission = waiter.await.unwrap();
        assert_eq!(admission, Admission::Admitted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_release_racing_with_block_admit_wakes_promptly() {
        let ctrl = std::sync::Arc::new(BackpressureController::new(
            1,
            OverflowPolicy::Block,
            Duration::from_millis(200),
        ));

        let started = std::time::Instant::now();
        for _ in 0..25 {
            let first = Uuid::new_v4();
            ctrl.admit(first).await;

            // Release on another thread while the second admit races in
            let releaser = {
                let ctrl = ctrl.clone();
                tokio::spawn(async move { ctrl.release(first) })
            };
            let second = Uuid::new_v4();
            assert_eq!(ctrl.admit(second).await, Admission::Admitted);
            releaser.await.unwrap();
            ctrl.release(second);
        }

        // A missed wakeup stalls an iteration for the full block timeout
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_capacity_reduction_does_not_evict() {
        let ctrl = controller(2, OverflowPolicy::Reject);
        ctrl.admit(Uuid::new_v4()).await;
        ctrl.admit(Uuid::new_v4()).await;

        ctrl.apply(1, OverflowPolicy::Reject);
        assert_eq!(ctrl.in_flight(), 2);

        // New publishes are rejected until enough slots free up
        assert!(matches!(
            ctrl.admit(Uuid::new_v4()).await,
            Admission::Rejected { .. }
        ));
    }
}
