use crate::{
    config::LeaseConfig,
    error::StoreError,
    store::{CoordinationStore, Refresh, StoreResult},
    NodeAssignment, NodeLeaseAllocator, Result,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

/// Store wrapper that can be cut off from the network on demand.
///
/// While unreachable every call fails with [`StoreError::Unreachable`]
/// before reaching the inner store, the same way a partitioned process
/// would see a real store.
#[derive(Debug)]
pub struct FlakyStore {
    inner: Arc<dyn CoordinationStore>,
    reachable: AtomicBool,
    backend_error: AtomicBool,
    set_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn CoordinationStore>) -> Self {
        Self {
            inner,
            reachable: AtomicBool::new(true),
            backend_error: AtomicBool::new(false),
            set_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn fail_with_backend_error(&self, fail: bool) {
        self.backend_error.store(fail, Ordering::SeqCst);
    }

    /// `set_if_absent` calls that reached the inner store
    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    /// `refresh_if_owner` calls that reached the inner store
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> StoreResult<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable("connection refused".to_string()));
        }
        if self.backend_error.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("READONLY replica".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for FlakyStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn refresh_if_owner(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<Refresh> {
        self.check()?;
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.refresh_if_owner(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.check()?;
        self.inner.ttl(key).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()?;
        self.inner.ping().await
    }
}

/// Start `count` simulated processes against one store and let them all
/// race through `acquire` at the same moment.
///
/// Results are in process order; each process has its own allocator and
/// holder token.
pub async fn race_processes(
    count: usize,
    store: Arc<dyn CoordinationStore>,
    config: LeaseConfig,
) -> Vec<(Arc<NodeLeaseAllocator>, Result<NodeAssignment>)> {
    let barrier = Arc::new(Barrier::new(count));
    let mut handles = Vec::with_capacity(count);

    for _ in 0..count {
        let allocator = Arc::new(
            NodeLeaseAllocator::new(config.clone(), store.clone())
                .expect("test config must be valid"),
        );
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            let result = allocator.acquire().await;
            (allocator, result)
        }));
    }

    let mut results = Vec::with_capacity(count);
    for handle in handles {
        results.push(handle.await.expect("simulated process panicked"));
    }
    results
}
