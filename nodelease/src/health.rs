use crate::allocator::{AllocatorSnapshot, AllocatorState, AssignmentMode, NodeLeaseAllocator};
use crate::store::StoreResult;
use crate::time::unix_millis;
use crate::tsid::IdGenerator;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Clock drift between a fresh TSID and the wall clock that gets flagged
pub const MAX_CLOCK_DRIFT_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Up,
    Degraded,
    Down,
}

/// Outcome of pinging the coordination store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreStatus {
    Connected,
    ConnectionFailed,
    NotConfigured,
}

/// Read-only view of node identity for dashboards and the health endpoint
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub state: AllocatorState,
    pub node_id: Option<u16>,
    pub mode: Option<AssignmentMode>,
    pub lease_key: Option<String>,
    pub holder: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub last_renewal: Option<DateTime<Utc>>,
    pub consecutive_renewal_failures: u32,
    pub last_error: Option<String>,
    pub max_node: u16,
    pub store: StoreStatus,
    pub store_error: Option<String>,
    pub sample_tsid: Option<u64>,
    pub clock_drift_ms: Option<u64>,
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    /// Ping the store and sample the generator.
    pub async fn collect(allocator: &NodeLeaseAllocator, generator: Option<&IdGenerator>) -> Self {
        let store = allocator.ping_store().await;
        Self::from_snapshot(allocator.snapshot(), store, generator)
    }

    /// Build a report from already gathered state. `store` is the result of
    /// a store ping, `None` when no store is configured.
    pub fn from_snapshot(
        snapshot: AllocatorSnapshot,
        store: Option<StoreResult<()>>,
        generator: Option<&IdGenerator>,
    ) -> Self {
        let mut warnings = Vec::new();

        let (store, store_error) = match store {
            None => (StoreStatus::NotConfigured, None),
            Some(Ok(())) => (StoreStatus::Connected, None),
            Some(Err(e)) => (StoreStatus::ConnectionFailed, Some(e.to_string())),
        };

        // A leased node cannot renew while the store is gone
        let status = match (snapshot.state, &snapshot.assignment) {
            (AllocatorState::Failed, _) | (_, None) => HealthStatus::Down,
            (_, Some(assignment)) if assignment.is_degraded() => HealthStatus::Degraded,
            _ if store == StoreStatus::ConnectionFailed => HealthStatus::Down,
            _ if snapshot.consecutive_failures > 0 => HealthStatus::Degraded,
            _ => HealthStatus::Up,
        };

        if snapshot.assignment.is_none() {
            warnings.push("Node id not allocated. TSID uniqueness may be compromised.".to_string());
        }
        if snapshot.assignment.as_ref().is_some_and(|a| a.is_degraded()) {
            warnings.push("Running in degraded mode with an unverified node id.".to_string());
        }
        if snapshot.consecutive_failures > 0 {
            warnings.push(format!(
                "{} consecutive lease renewal failures",
                snapshot.consecutive_failures
            ));
        }

        if let Some(error) = &store_error {
            tracing::warn!("TSID health check: coordination store connection failed: {error}");
            warnings.push(format!(
                "Coordination store connection failed ({error}). \
                 Lease renewals will fail until it recovers."
            ));
        }

        let sample = generator.and_then(|g| g.next_id().ok());
        let clock_drift_ms = sample.map(|tsid| unix_millis().abs_diff(tsid.unix_millis()));
        if let Some(drift) = clock_drift_ms.filter(|d| *d > MAX_CLOCK_DRIFT_MS) {
            tracing::warn!("TSID health check: clock drift of {drift} ms");
            warnings.push(format!(
                "Clock synchronization issue: {drift} ms drift. \
                 Ensure NTP is configured; TSID ordering may suffer."
            ));
        }

        let assignment = snapshot.assignment.as_ref();
        Self {
            status,
            state: snapshot.state,
            node_id: assignment.map(|a| a.node_id.get()),
            mode: assignment.map(|a| a.mode),
            lease_key: assignment.and_then(|a| a.lease_key.clone()),
            holder: assignment.map(|a| a.holder.to_string()),
            acquired_at: assignment.map(|a| a.acquired_at),
            last_renewal: snapshot.last_renewal,
            consecutive_renewal_failures: snapshot.consecutive_failures,
            last_error: snapshot.last_error,
            max_node: snapshot.max_node,
            store,
            store_error,
            sample_tsid: sample.map(u64::from),
            clock_drift_ms,
            warnings,
            timestamp: Utc::now(),
        }
    }

    pub fn is_serving(&self) -> bool {
        self.status != HealthStatus::Down
    }
}
