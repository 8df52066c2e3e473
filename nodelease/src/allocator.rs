// Node slot allocator - acquisition and renewal of the process lease

use crate::config::LeaseConfig;
use crate::error::StoreError;
use crate::store::{CoordinationStore, Refresh, StoreResult};
use crate::{Error, NodeId, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of the allocator within one process.
///
/// `Uninitialized -> Acquiring -> {Acquired | Degraded | Failed}`, with
/// `Acquired <-> Renewing` afterwards. There is no way back to `Acquiring`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocatorState {
    Uninitialized,
    Acquiring,
    Acquired,
    Renewing,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentMode {
    /// Backed by a lease in the coordination store
    Leased,
    /// Randomly chosen without any exclusivity guarantee
    Degraded,
}

/// The node id this process owns for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeAssignment {
    pub node_id: NodeId,
    /// Store key backing the lease, absent in degraded mode
    pub lease_key: Option<String>,
    /// Value stored under `lease_key`, unique to this process
    pub holder: Uuid,
    pub mode: AssignmentMode,
    pub acquired_at: DateTime<Utc>,
}

impl NodeAssignment {
    pub fn is_degraded(&self) -> bool {
        self.mode == AssignmentMode::Degraded
    }
}

/// Point-in-time view of the allocator, for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct AllocatorSnapshot {
    pub state: AllocatorState,
    pub assignment: Option<NodeAssignment>,
    pub last_renewal: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub max_node: u16,
}

#[derive(Debug)]
struct Status {
    state: AllocatorState,
    assignment: Option<NodeAssignment>,
    last_renewal: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    last_error: Option<String>,
}

pub struct NodeLeaseAllocator {
    config: LeaseConfig,
    store: Option<Arc<dyn CoordinationStore>>,
    holder: Uuid,
    status: RwLock<Status>,
}

impl std::fmt::Debug for NodeLeaseAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLeaseAllocator")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("holder", &self.holder)
            .field("state", &self.status.read().state)
            .finish()
    }
}

impl NodeLeaseAllocator {
    pub fn new(config: LeaseConfig, store: Arc<dyn CoordinationStore>) -> Result<Self> {
        Self::build(config, Some(store))
    }

    /// Allocator for a process with no coordination store configured.
    /// `acquire` then fails fast unless degraded mode is allowed.
    pub fn without_store(config: LeaseConfig) -> Result<Self> {
        Self::build(config, None)
    }

    fn build(config: LeaseConfig, store: Option<Arc<dyn CoordinationStore>>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            holder: Uuid::new_v4(),
            status: RwLock::new(Status {
                state: AllocatorState::Uninitialized,
                assignment: None,
                last_renewal: None,
                consecutive_failures: 0,
                last_error: None,
            }),
        })
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    pub fn holder(&self) -> Uuid {
        self.holder
    }

    pub fn state(&self) -> AllocatorState {
        self.status.read().state
    }

    pub fn assignment(&self) -> Option<NodeAssignment> {
        self.status.read().assignment.clone()
    }

    /// Round trip to the coordination store; `None` when there is none.
    pub async fn ping_store(&self) -> Option<StoreResult<()>> {
        match &self.store {
            Some(store) => Some(store.ping().await),
            None => None,
        }
    }

    pub fn snapshot(&self) -> AllocatorSnapshot {
        let status = self.status.read();
        AllocatorSnapshot {
            state: status.state,
            assignment: status.assignment.clone(),
            last_renewal: status.last_renewal,
            consecutive_failures: status.consecutive_failures,
            last_error: status.last_error.clone(),
            max_node: self.config.max_node,
        }
    }

    /// Claim the lowest free node slot.
    ///
    /// May be called once per allocator. Must complete before anything that
    /// mints ids is started.
    pub async fn acquire(&self) -> Result<NodeAssignment> {
        {
            let mut status = self.status.write();
            if status.state != AllocatorState::Uninitialized {
                return Err(Error::AlreadyInitialized);
            }
            status.state = AllocatorState::Acquiring;
        }

        let outcome = match &self.store {
            Some(store) => self.claim_lowest_free(store.as_ref()).await,
            None => Err(StoreError::Unreachable(
                "no coordination store configured".to_string(),
            )),
        };

        match outcome {
            Ok(Some((slot, key))) => {
                let assignment = NodeAssignment {
                    node_id: NodeId::new(slot)?,
                    lease_key: Some(key),
                    holder: self.holder,
                    mode: AssignmentMode::Leased,
                    acquired_at: Utc::now(),
                };
                info!(
                    node_id = slot,
                    key = assignment.lease_key.as_deref().unwrap_or_default(),
                    "Allocated TSID node id {} (range 0-{})",
                    slot,
                    self.config.max_node - 1
                );
                self.finish(AllocatorState::Acquired, &assignment);
                Ok(assignment)
            }
            Ok(None) => {
                let err = Error::CapacityExhausted {
                    max_node: self.config.max_node,
                };
                error!("{err}");
                self.fail(&err);
                Err(err)
            }
            Err(source) if self.config.allow_degraded => {
                let slot = rand::thread_rng().gen_range(0..self.config.max_node);
                warn!(
                    node_id = slot,
                    "DEGRADED MODE: {source}. Using random node id {slot}; \
                     TSID uniqueness is NOT guaranteed across instances"
                );
                let assignment = NodeAssignment {
                    node_id: NodeId::new(slot)?,
                    lease_key: None,
                    holder: self.holder,
                    mode: AssignmentMode::Degraded,
                    acquired_at: Utc::now(),
                };
                self.finish(AllocatorState::Degraded, &assignment);
                Ok(assignment)
            }
            Err(source) => {
                let err = match source {
                    StoreError::Unreachable(_) => Error::Connectivity { source },
                    StoreError::Backend(_) => Error::Store { source },
                };
                error!("{err}");
                self.fail(&err);
                Err(err)
            }
        }
    }

    async fn claim_lowest_free(
        &self,
        store: &dyn CoordinationStore,
    ) -> std::result::Result<Option<(u16, String)>, StoreError> {
        let holder = self.holder.to_string();
        let ttl = self.config.ttl();

        for slot in 0..self.config.max_node {
            let key = self.config.key_for(slot);
            if store.set_if_absent(&key, &holder, ttl).await? {
                return Ok(Some((slot, key)));
            }
            debug!(slot, "Node slot taken");
        }
        Ok(None)
    }

    fn finish(&self, state: AllocatorState, assignment: &NodeAssignment) {
        let mut status = self.status.write();
        status.state = state;
        status.assignment = Some(assignment.clone());
    }

    fn fail(&self, err: &Error) {
        let mut status = self.status.write();
        status.state = AllocatorState::Failed;
        status.last_error = Some(err.to_string());
    }

    /// Push the lease expiry back out to the full TTL.
    ///
    /// The stored value is left alone, and nothing is written if the key
    /// has meanwhile expired or been claimed by another process. Failures
    /// are returned for the caller to log; the assignment stays in use
    /// either way.
    pub async fn renew(&self, assignment: &NodeAssignment) -> Result<()> {
        let Some(key) = assignment.lease_key.as_deref() else {
            debug!(node_id = %assignment.node_id, "No lease to renew in degraded mode");
            return Ok(());
        };
        let Some(store) = &self.store else {
            return Err(Error::Renewal {
                key: key.to_string(),
                reason: "no coordination store configured".to_string(),
            });
        };

        self.status.write().state = AllocatorState::Renewing;

        let outcome = store
            .refresh_if_owner(key, &assignment.holder.to_string(), self.config.ttl())
            .await;

        let reason = match outcome {
            Ok(Refresh::Refreshed) => None,
            Ok(Refresh::Missing) => Some("lease no longer exists".to_string()),
            Ok(Refresh::HeldByOther) => Some("lease now held by another process".to_string()),
            Err(e) => Some(e.to_string()),
        };

        let mut status = self.status.write();
        status.state = AllocatorState::Acquired;
        match reason {
            None => {
                status.last_renewal = Some(Utc::now());
                status.consecutive_failures = 0;
                status.last_error = None;
                debug!(key, "Refreshed TSID node lease");
                Ok(())
            }
            Some(reason) => {
                status.consecutive_failures += 1;
                let err = Error::Renewal {
                    key: key.to_string(),
                    reason,
                };
                status.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::test_utils::FlakyStore;
    use crate::time::ManualClock;
    use std::time::Duration;

    fn config(max_node: u16) -> LeaseConfig {
        LeaseConfig {
            max_node,
            ..LeaseConfig::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_lowest_slot() {
        let store = Arc::new(InMemoryStore::new());
        let allocator = NodeLeaseAllocator::new(config(8), store.clone()).unwrap();
        assert_eq!(allocator.state(), AllocatorState::Uninitialized);

        let assignment = allocator.acquire().await.unwrap();
        assert_eq!(assignment.node_id.get(), 0);
        assert_eq!(assignment.lease_key.as_deref(), Some("sys:tsid:node:0"));
        assert_eq!(assignment.mode, AssignmentMode::Leased);
        assert_eq!(allocator.state(), AllocatorState::Acquired);

        let holder = store.get("sys:tsid:node:0").await.unwrap();
        assert_eq!(holder, Some(allocator.holder().to_string()));
    }

    #[tokio::test]
    async fn test_acquire_only_once() {
        let store = Arc::new(InMemoryStore::new());
        let allocator = NodeLeaseAllocator::new(config(8), store.clone()).unwrap();
        allocator.acquire().await.unwrap();

        assert!(matches!(allocator.acquire().await, Err(Error::AlreadyInitialized)));
        assert_eq!(store.live_keys(), 1);
    }

    #[tokio::test]
    async fn test_capacity_exhausted() {
        let store = Arc::new(InMemoryStore::new());
        for _ in 0..2 {
            NodeLeaseAllocator::new(config(2), store.clone())
                .unwrap()
                .acquire()
                .await
                .unwrap();
        }

        let third = NodeLeaseAllocator::new(config(2), store).unwrap();
        assert!(matches!(
            third.acquire().await,
            Err(Error::CapacityExhausted { max_node: 2 })
        ));
        assert_eq!(third.state(), AllocatorState::Failed);
        assert!(third.assignment().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_fast() {
        let store = Arc::new(FlakyStore::new(Arc::new(InMemoryStore::new())));
        store.set_reachable(false);
        let allocator = NodeLeaseAllocator::new(config(8), store).unwrap();

        let result = allocator.acquire().await;
        assert!(matches!(result, Err(Error::Connectivity { .. })));
        assert_eq!(allocator.state(), AllocatorState::Failed);
        assert!(allocator.assignment().is_none());
    }

    #[tokio::test]
    async fn test_missing_store_fails_fast() {
        let allocator = NodeLeaseAllocator::without_store(config(8)).unwrap();
        assert!(matches!(
            allocator.acquire().await,
            Err(Error::Connectivity { .. })
        ));
    }

    #[tokio::test]
    async fn test_backend_error_is_fatal_without_degraded_mode() {
        let store = Arc::new(FlakyStore::new(Arc::new(InMemoryStore::new())));
        store.fail_with_backend_error(true);
        let allocator = NodeLeaseAllocator::new(config(8), store).unwrap();

        assert!(matches!(allocator.acquire().await, Err(Error::Store { .. })));
    }

    #[tokio::test]
    async fn test_degraded_without_store() {
        let allocator = NodeLeaseAllocator::without_store(LeaseConfig {
            allow_degraded: true,
            ..config(16)
        })
        .unwrap();

        let assignment = allocator.acquire().await.unwrap();
        assert!(assignment.node_id.get() < 16);
        assert!(assignment.is_degraded());
        assert_eq!(assignment.lease_key, None);
        assert_eq!(allocator.state(), AllocatorState::Degraded);

        // Nothing to renew
        allocator.renew(&assignment).await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_keeps_value_and_resets_ttl() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let allocator = NodeLeaseAllocator::new(config(4), store.clone()).unwrap();
        let assignment = allocator.acquire().await.unwrap();
        let key = assignment.lease_key.clone().unwrap();

        clock.advance(Duration::from_secs(12 * 3600));
        assert_eq!(store.ttl(&key).await.unwrap(), Some(Duration::from_secs(12 * 3600)));

        allocator.renew(&assignment).await.unwrap();
        assert_eq!(store.ttl(&key).await.unwrap(), Some(Duration::from_secs(24 * 3600)));
        assert_eq!(store.get(&key).await.unwrap(), Some(assignment.holder.to_string()));

        let snapshot = allocator.snapshot();
        assert_eq!(snapshot.state, AllocatorState::Acquired);
        assert!(snapshot.last_renewal.is_some());
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_renew_failure_is_counted_not_fatal() {
        let inner = Arc::new(InMemoryStore::new());
        let store = Arc::new(FlakyStore::new(inner));
        let allocator = NodeLeaseAllocator::new(config(4), store.clone()).unwrap();
        let assignment = allocator.acquire().await.unwrap();

        store.set_reachable(false);
        for expected in 1..=3 {
            let err = allocator.renew(&assignment).await.unwrap_err();
            assert!(matches!(err, Error::Renewal { .. }));
            assert_eq!(allocator.snapshot().consecutive_failures, expected);
        }
        assert_eq!(allocator.state(), AllocatorState::Acquired);
        assert_eq!(allocator.assignment(), Some(assignment.clone()));

        store.set_reachable(true);
        allocator.renew(&assignment).await.unwrap();
        assert_eq!(allocator.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_renew_does_not_touch_a_reclaimed_lease() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let first = NodeLeaseAllocator::new(config(1), store.clone()).unwrap();
        let assignment = first.acquire().await.unwrap();

        clock.advance(Duration::from_secs(24 * 3600));
        let second = NodeLeaseAllocator::new(config(1), store.clone()).unwrap();
        second.acquire().await.unwrap();

        clock.advance(Duration::from_secs(3600));
        let err = first.renew(&assignment).await.unwrap_err();
        assert!(matches!(err, Error::Renewal { .. }));

        // The new owner's lease keeps its original expiry
        let key = assignment.lease_key.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(second.holder().to_string()));
        assert_eq!(store.ttl(&key).await.unwrap(), Some(Duration::from_secs(23 * 3600)));
    }
}
