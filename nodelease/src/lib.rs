#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Node-slot leasing for time-sorted ID generation.
//!
//! Every process that emits TSIDs needs a node id no other live process is
//! using. [`NodeLeaseAllocator`] claims one from a shared
//! [`CoordinationStore`] with a set-if-absent lease, [`RenewalTask`] keeps
//! the lease alive, and [`IdGenerator`] refuses to hand out ids until a node
//! has been installed.

pub mod allocator;
pub mod config;
pub mod error;
pub mod health;
pub mod renewal;
pub mod store;
pub mod time;
pub mod tsid;

pub mod test_utils;

pub use allocator::{AllocatorState, AssignmentMode, NodeAssignment, NodeLeaseAllocator};
pub use config::LeaseConfig;
pub use error::{Error, Result, StoreError};
pub use health::{HealthReport, HealthStatus, StoreStatus};
pub use renewal::{RenewalHandle, RenewalTask};
pub use store::{CoordinationStore, InMemoryStore, Refresh};
pub use tsid::{IdGenerator, Tsid, TsidFactory};

/// Number of distinct node ids a TSID can carry (10 bits).
pub const MAX_NODE: u16 = 1 << tsid::NODE_BITS;

/// A node slot in `[0, MAX_NODE)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(try_from = "u16", into = "u16")]
pub struct NodeId(u16);

impl NodeId {
    pub fn new(id: u16) -> Result<Self> {
        if id < MAX_NODE {
            Ok(Self(id))
        } else {
            Err(Error::InvalidNodeId { id })
        }
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for NodeId {
    type Error = Error;

    fn try_from(id: u16) -> Result<Self> {
        Self::new(id)
    }
}

impl From<NodeId> for u16 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
