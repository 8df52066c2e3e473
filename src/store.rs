use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nodelease::store::StoreResult;
use nodelease::{CoordinationStore, InMemoryStore, Refresh, StoreError};

/// Stand-in for a store that could not be reached at startup.
///
/// Every call reports the original connection failure, so acquisition goes
/// through the same fail-fast or degraded path as a failure mid-scan.
#[derive(Debug, Clone)]
pub struct UnreachableStore {
    reason: String,
}

impl UnreachableStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn err<T>(&self) -> StoreResult<T> {
        Err(StoreError::Unreachable(self.reason.clone()))
    }
}

#[async_trait]
impl CoordinationStore for UnreachableStore {
    async fn set_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> StoreResult<bool> {
        self.err()
    }

    async fn refresh_if_owner(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Duration,
    ) -> StoreResult<Refresh> {
        self.err()
    }

    async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
        self.err()
    }

    async fn ttl(&self, _key: &str) -> StoreResult<Option<Duration>> {
        self.err()
    }

    async fn ping(&self) -> StoreResult<()> {
        self.err()
    }
}

pub type SharedStore = Arc<dyn CoordinationStore>;

/// Whether `endpoint` names a store that lives and dies with this process.
///
/// Leases in such a store cannot collide with other processes, so short-lived
/// commands may take one without holding a slot in a shared store.
pub fn is_process_local(endpoint: Option<&str>) -> bool {
    match endpoint {
        None => true,
        Some(endpoint) => endpoint.starts_with("memory://"),
    }
}

/// Build the coordination store client named by `endpoint`.
///
/// `None` means no store is configured. A store that cannot be reached is
/// reported as [`StoreError::Unreachable`] so the allocator's degraded-mode
/// policy decides what happens next.
pub async fn connect(endpoint: Option<&str>) -> Result<Option<SharedStore>, StoreError> {
    let Some(endpoint) = endpoint else {
        return Ok(None);
    };

    match endpoint.split_once("://").map(|(scheme, _)| scheme) {
        Some("memory") => {
            tracing::warn!(
                "Using an in-process coordination store; \
                 node ids are only unique within this process"
            );
            Ok(Some(Arc::new(InMemoryStore::new())))
        }
        Some("redis" | "rediss") => connect_redis(endpoint).await,
        _ => Err(StoreError::Backend(format!(
            "unsupported coordination store endpoint {endpoint:?}"
        ))),
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(endpoint: &str) -> Result<Option<SharedStore>, StoreError> {
    let store = nodelease::store::RedisStore::connect(endpoint).await?;
    Ok(Some(Arc::new(store)))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(endpoint: &str) -> Result<Option<SharedStore>, StoreError> {
    Err(StoreError::Backend(format!(
        "{endpoint} needs the `redis` feature; rebuild with --features redis"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_endpoint_means_no_store() {
        assert!(connect(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_endpoint() {
        let store = connect(Some("memory://")).await.unwrap().unwrap();
        assert!(store.set_if_absent("k", "v", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_store_reports_reason() {
        let store = UnreachableStore::new("connection refused");
        assert_eq!(
            store.set_if_absent("k", "v", Duration::from_secs(1)).await,
            Err(StoreError::Unreachable("connection refused".to_string()))
        );
        assert!(store.ping().await.is_err());
    }

    #[test]
    fn test_process_local_endpoints() {
        assert!(is_process_local(None));
        assert!(is_process_local(Some("memory://")));
        assert!(!is_process_local(Some("redis://cache:6379")));
        assert!(!is_process_local(Some("rediss://cache:6380")));
    }

    #[tokio::test]
    async fn test_unknown_scheme_rejected() {
        assert!(matches!(
            connect(Some("etcd://localhost:2379")).await,
            Err(StoreError::Backend(_))
        ));
        assert!(matches!(connect(Some("localhost")).await, Err(StoreError::Backend(_))));
    }
}
