// Coordination store abstraction
//
// The only cross-process synchronization point in the whole system is the
// store's atomic set-if-absent. Everything else a process does touches only
// its own lease key.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

use crate::error::StoreError;
use async_trait::async_trait;
use std::time::Duration;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Outcome of a conditional TTL refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// The key still held our value and its TTL was reset
    Refreshed,
    /// The key no longer exists (expired or deleted)
    Missing,
    /// The key exists but holds somebody else's value
    HeldByOther,
}

#[async_trait]
pub trait CoordinationStore: Send + Sync + std::fmt::Debug {
    /// Atomically create `key` with `value` and `ttl` unless it already
    /// exists. Returns `Ok(true)` for exactly one concurrent caller.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Reset the TTL of `key` to `ttl` if it still holds `value`. Never
    /// rewrites the value.
    async fn refresh_if_owner(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<Refresh>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Remaining time to live, `None` if the key does not exist.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Cheap round trip to check the store is reachable.
    async fn ping(&self) -> StoreResult<()>;
}
