// Periodic lease renewal
//
// Runs beside request handling for the life of the process. A failed
// renewal is logged and retried on the next tick; the lease is never
// released, so a process that stops renewing simply loses its slot when the
// TTL runs out.

use crate::allocator::{NodeAssignment, NodeLeaseAllocator};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct RenewalTask {
    allocator: Arc<NodeLeaseAllocator>,
    assignment: NodeAssignment,
    interval: Duration,
}

impl RenewalTask {
    pub fn new(allocator: Arc<NodeLeaseAllocator>, assignment: NodeAssignment) -> Self {
        let interval = allocator.config().renew_interval();
        Self {
            allocator,
            assignment,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start renewing on the current tokio runtime. The first renewal
    /// happens one full interval from now.
    pub fn spawn(self, cancel: CancellationToken) -> RenewalHandle {
        let token = cancel.clone();
        let join = tokio::spawn(self.run(token));
        RenewalHandle { cancel, join }
    }

    async fn run(self, cancel: CancellationToken) {
        let Some(key) = self.assignment.lease_key.clone() else {
            warn!(
                node_id = %self.assignment.node_id,
                "Degraded node id has no lease; renewal disabled"
            );
            return;
        };

        let ttl = self.allocator.config().ttl();
        // Interval is bounded by the validated TTL cap
        let start = Instant::now()
            .checked_add(self.interval)
            .unwrap_or_else(Instant::now);
        let mut ticker = interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            key = %key,
            interval_secs = self.interval.as_secs(),
            "Lease renewal scheduled"
        );

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(key = %key, "Lease renewal stopped; lease left to expire on its own");
                    break;
                }
                _ = ticker.tick() => {}
            }

            match self.allocator.renew(&self.assignment).await {
                Ok(()) => debug!(key = %key, "Lease renewed"),
                Err(e) => {
                    let failures = self.allocator.snapshot().consecutive_failures;
                    error!(
                        failures,
                        "{e}. Lease expires within {}s unless a later renewal succeeds",
                        ttl.as_secs()
                    );
                    if lease_probably_lapsed(self.interval, failures, ttl) {
                        warn!(
                            key = %key,
                            failures,
                            "Lease has probably expired; another process may reuse node id {}",
                            self.assignment.node_id
                        );
                    }
                }
            }
        }
    }
}

/// Whether `failures` missed renewals in a row add up to a whole TTL
fn lease_probably_lapsed(interval: Duration, failures: u32, ttl: Duration) -> bool {
    interval.checked_mul(failures).map_or(true, |missed| missed >= ttl)
}

/// Owner's handle on a running [`RenewalTask`].
#[derive(Debug)]
pub struct RenewalHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl RenewalHandle {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop renewing and wait for the task to exit. The lease is not
    /// deleted.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            error!("Lease renewal task ended abnormally: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LeaseConfig;
    use crate::store::{CoordinationStore, InMemoryStore};
    use crate::test_utils::FlakyStore;
    use crate::time::TokioClock;
    use crate::AllocatorState;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_lease_probably_lapsed() {
        assert!(!lease_probably_lapsed(12 * HOUR, 1, 24 * HOUR));
        assert!(lease_probably_lapsed(12 * HOUR, 2, 24 * HOUR));
        assert!(!lease_probably_lapsed(10 * HOUR, 2, 24 * HOUR));
        assert!(lease_probably_lapsed(Duration::MAX, u32::MAX, 24 * HOUR));
    }

    async fn leased(
        store: Arc<dyn CoordinationStore>,
    ) -> (Arc<NodeLeaseAllocator>, NodeAssignment) {
        let allocator = Arc::new(NodeLeaseAllocator::new(LeaseConfig::default(), store).unwrap());
        let assignment = allocator.acquire().await.unwrap();
        (allocator, assignment)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_renewal_waits_a_full_interval() {
        let inner = Arc::new(InMemoryStore::with_clock(Arc::new(TokioClock::starting_at(0))));
        let store = Arc::new(FlakyStore::new(inner));
        let (allocator, assignment) = leased(store.clone()).await;

        let handle = RenewalTask::new(allocator, assignment).spawn(CancellationToken::new());

        tokio::time::sleep(11 * HOUR).await;
        assert_eq!(store.refresh_calls(), 0);

        tokio::time::sleep(2 * HOUR).await;
        assert_eq!(store.refresh_calls(), 1);

        tokio::time::sleep(12 * HOUR).await;
        assert_eq!(store.refresh_calls(), 2);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_renewals_do_not_stop_the_task() {
        let inner = Arc::new(InMemoryStore::with_clock(Arc::new(TokioClock::starting_at(0))));
        let store = Arc::new(FlakyStore::new(inner));
        let (allocator, assignment) = leased(store.clone()).await;
        let key = assignment.lease_key.clone().unwrap();

        let handle =
            RenewalTask::new(allocator.clone(), assignment).spawn(CancellationToken::new());
        store.set_reachable(false);

        tokio::time::sleep(25 * HOUR).await;
        assert!(!handle.is_finished());
        assert_eq!(allocator.snapshot().consecutive_failures, 2);
        assert_eq!(allocator.state(), AllocatorState::Acquired);

        // Reachable again, but the lease already lapsed at 24h
        store.set_reachable(true);
        assert_eq!(store.get(&key).await.unwrap(), None);

        tokio::time::sleep(12 * HOUR).await;
        assert_eq!(allocator.snapshot().consecutive_failures, 3);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_leaves_lease_in_place() {
        let inner = Arc::new(InMemoryStore::with_clock(Arc::new(TokioClock::starting_at(0))));
        let (allocator, assignment) = leased(inner.clone()).await;
        let key = assignment.lease_key.clone().unwrap();

        let cancel = CancellationToken::new();
        let handle = RenewalTask::new(allocator, assignment).spawn(cancel.child_token());

        tokio::time::sleep(HOUR).await;
        handle.shutdown().await;

        assert!(!cancel.is_cancelled());
        assert!(inner.get(&key).await.unwrap().is_some());
        assert_eq!(inner.ttl(&key).await.unwrap(), Some(23 * HOUR));
    }

    #[tokio::test]
    async fn test_degraded_assignment_has_nothing_to_renew() {
        let allocator = Arc::new(
            NodeLeaseAllocator::without_store(LeaseConfig {
                allow_degraded: true,
                ..LeaseConfig::default()
            })
            .unwrap(),
        );
        let assignment = allocator.acquire().await.unwrap();

        let handle = RenewalTask::new(allocator, assignment).spawn(CancellationToken::new());
        handle.shutdown().await;
    }
}
