use super::{CoordinationStore, Refresh, StoreResult};
use crate::time::{Clock, SystemClock};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredLease {
    value: String,
    expires_at: u64,
}

impl StoredLease {
    fn is_live(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

/// Process-local coordination store.
///
/// Good for tests and single-host runs; every allocator sharing one
/// instance (through an `Arc`) sees the same leases. Expired keys behave
/// exactly like absent ones.
#[derive(Debug)]
pub struct InMemoryStore {
    data: DashMap<String, StoredLease>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: DashMap::new(),
            clock,
        }
    }

    /// Number of unexpired keys
    pub fn live_keys(&self) -> usize {
        let now = self.clock.now_millis();
        self.data.iter().filter(|entry| entry.value().is_live(now)).count()
    }

    fn expiry(&self, ttl: Duration) -> u64 {
        let ttl = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.clock.now_millis().saturating_add(ttl)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let now = self.clock.now_millis();
        let lease = StoredLease {
            value: value.to_string(),
            expires_at: self.expiry(ttl),
        };

        // The entry guard holds the shard lock, so check-and-insert is atomic
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(lease);
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(lease);
                Ok(true)
            }
        }
    }

    async fn refresh_if_owner(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<Refresh> {
        let now = self.clock.now_millis();
        let expires_at = self.expiry(ttl);

        match self.data.get_mut(key) {
            Some(mut lease) if lease.is_live(now) => {
                if lease.value == value {
                    lease.expires_at = expires_at;
                    Ok(Refresh::Refreshed)
                } else {
                    Ok(Refresh::HeldByOther)
                }
            }
            _ => Ok(Refresh::Missing),
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now_millis();
        Ok(self
            .data
            .get(key)
            .filter(|lease| lease.is_live(now))
            .map(|lease| lease.value.clone()))
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = self.clock.now_millis();
        Ok(self
            .data
            .get(key)
            .filter(|lease| lease.is_live(now))
            .map(|lease| Duration::from_millis(lease.expires_at.saturating_sub(now))))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
