use thiserror::Error;

/// Failures reported by a [`crate::CoordinationStore`].
///
/// "Key already exists" is not an error: `set_if_absent` returns `Ok(false)`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Coordination store unreachable: {0}")]
    Unreachable(String),

    #[error("Coordination store error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(
        "Cannot allocate node id: coordination store unreachable ({source}). \
         Set allow_degraded for local development only"
    )]
    Connectivity { source: StoreError },

    #[error(
        "Cannot allocate node id: all node ids 0-{} are in use. Check for stale leases",
        .max_node.saturating_sub(1)
    )]
    CapacityExhausted { max_node: u16 },

    #[error("Failed to renew lease {key}: {reason}")]
    Renewal { key: String, reason: String },

    #[error("ID generator used before a node id was installed")]
    NotInitialized,

    #[error("Node id already initialized for this process")]
    AlreadyInitialized,

    #[error("Node id {id} out of range")]
    InvalidNodeId { id: u16 },

    #[error("Invalid lease configuration: {0}")]
    InvalidConfig(String),

    #[error("Cannot allocate node id: {source}")]
    Store { source: StoreError },
}

pub type Result<T> = std::result::Result<T, Error>;
