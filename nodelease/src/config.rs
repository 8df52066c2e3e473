use crate::{Error, Result, MAX_NODE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_KEY_PREFIX: &str = "sys:tsid:node:";

/// Default lease TTL (24 hours)
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default renewal period (12 hours), half the TTL
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Longest lease TTL accepted (30 days)
pub const MAX_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Lease parameters, as read from the `[lease]` table of the daemon config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeaseConfig {
    pub key_prefix: String,
    pub max_node: u16,
    pub ttl_secs: u64,
    pub renew_interval_secs: u64,
    /// Fall back to a random, unverified node id when the store is down.
    /// Never enable this for a multi-instance deployment.
    pub allow_degraded: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            max_node: MAX_NODE,
            ttl_secs: DEFAULT_TTL.as_secs(),
            renew_interval_secs: DEFAULT_RENEW_INTERVAL.as_secs(),
            allow_degraded: false,
        }
    }
}

impl LeaseConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.renew_interval_secs)
    }

    pub fn key_for(&self, slot: u16) -> String {
        format!("{}{}", self.key_prefix, slot)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(Error::InvalidConfig("key_prefix must not be empty".into()));
        }
        if self.max_node == 0 || self.max_node > MAX_NODE {
            return Err(Error::InvalidConfig(format!(
                "max_node must be in 1..={MAX_NODE}, got {}",
                self.max_node
            )));
        }
        if self.ttl_secs == 0 || self.ttl_secs > MAX_TTL.as_secs() {
            return Err(Error::InvalidConfig(format!(
                "ttl_secs must be in 1..={}, got {}",
                MAX_TTL.as_secs(),
                self.ttl_secs
            )));
        }
        if self.renew_interval_secs == 0 || self.renew_interval_secs >= self.ttl_secs {
            return Err(Error::InvalidConfig(format!(
                "renew_interval_secs ({}) must be positive and shorter than ttl_secs ({})",
                self.renew_interval_secs, self.ttl_secs
            )));
        }
        Ok(())
    }
}
