use super::{CoordinationStore, Refresh, StoreResult};
use crate::error::StoreError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisError, Script};
use std::time::Duration;

// Returns 1 when refreshed, 0 when held by another value, -1 when missing
const REFRESH_IF_OWNER: &str = r"
local current = redis.call('GET', KEYS[1])
if not current then
    return -1
end
if current == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

/// Coordination store backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    endpoint: String,
    conn: ConnectionManager,
    refresh: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `endpoint` (a `redis://` URL).
    ///
    /// A server that cannot be reached here yields
    /// [`StoreError::Unreachable`], so callers can apply their degraded-mode
    /// policy the same way they would for a failure mid-scan.
    pub async fn connect(endpoint: &str) -> StoreResult<Self> {
        let client =
            redis::Client::open(endpoint).map_err(|e| StoreError::Backend(e.to_string()))?;
        let conn = ConnectionManager::new(client).await.map_err(classify)?;
        tracing::info!("Connected to redis coordination store at {endpoint}");

        Ok(Self {
            endpoint: endpoint.to_string(),
            conn,
            refresh: Script::new(REFRESH_IF_OWNER),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn classify(err: RedisError) -> StoreError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        StoreError::Unreachable(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn refresh_outcome(reply: i64) -> Refresh {
    match reply {
        1 => Refresh::Refreshed,
        0 => Refresh::HeldByOther,
        _ => Refresh::Missing,
    }
}

// PTTL replies -2 for no such key and -1 for a key without expiry
fn remaining(pttl: i64) -> Option<Duration> {
    match pttl {
        -2 => None,
        -1 => Some(Duration::MAX),
        ms => Some(Duration::from_millis(u64::try_from(ms).unwrap_or(0))),
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(reply.is_some())
    }

    async fn refresh_if_owner(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<Refresh> {
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .refresh
            .key(key)
            .arg(value)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;

        Ok(refresh_outcome(outcome))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(classify)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        let pttl: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;

        Ok(remaining(pttl))
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(())
    }
}
