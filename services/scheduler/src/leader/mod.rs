//! Leader election over a ZooKeeper-style coordination service.
//!
//! Every scheduler replica creates an ephemeral, sequentially numbered node
//! under the election root. The replica owning the smallest surviving node is
//! the leader; it publishes its listen address as that node's data. Followers
//! read the address from the leader's node and watch it for deletion. When the
//! leader's session ends its node disappears and every follower re-runs the
//! election.
//!
//! ```text
//! /drover/leader-election
//!   ├── 00000000007   data = "10.0.0.1:9999"   <- leader
//!   ├── 00000000009   data = ""
//!   └── 00000000012   data = ""
//! ```
//!
//! The service itself is consumed through [`Coordination`], so the election
//! logic in [`Coordinator`] does not depend on a particular client.
//! [`ZkCoordination`] talks to a real ensemble; [`MemoryCoordination`] keeps
//! the tree in process for tests.

mod coordinator;
mod memory;
mod zookeeper;

use async_trait::async_trait;
use thiserror::Error;

pub use coordinator::{Coordinator, ElectionConfig};
pub use memory::{MemoryCoordination, MemorySession};
pub use zookeeper::{ZkConfig, ZkCoordination};

/// Role of this process in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Leadership {
    /// No election has completed yet.
    #[default]
    Unknown,

    /// This process leads and serves at `addr`.
    Leader { addr: String },

    /// Another process leads and serves at `leader_addr`.
    Follower { leader_addr: String },
}

impl Leadership {
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader { .. })
    }

    /// Address of the current leader, if one is known.
    pub fn leader_addr(&self) -> Option<&str> {
        match self {
            Self::Leader { addr } => Some(addr),
            Self::Follower { leader_addr } => Some(leader_addr),
            Self::Unknown => None,
        }
    }

    /// Short role name used in logs and the persisted election state.
    pub fn role(&self) -> &'static str {
        match self {
            Self::Leader { .. } => "leader",
            Self::Follower { .. } => "follower",
            Self::Unknown => "unknown",
        }
    }
}

/// Errors from the coordination service.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("node does not exist: {0}")]
    NoNode(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    /// The session is closed; its ephemeral nodes are gone.
    #[error("coordination session expired")]
    SessionExpired,

    /// This process's own election node vanished while the session was live.
    #[error("election node lost: {0}")]
    NodeLost(String),

    /// The service could not be reached or rejected the call.
    #[error("coordination service unavailable: {0}")]
    Unavailable(String),
}

/// The subset of a ZooKeeper-like client the election needs.
///
/// Paths are absolute and `/`-separated. Children are returned as bare names.
#[async_trait]
pub trait Coordination: Send + Sync {
    /// Create `path` and any missing ancestors as persistent nodes.
    async fn ensure_path(&self, path: &str) -> Result<(), CoordinationError>;

    /// Create an ephemeral node named `prefix` plus a zero-padded sequence
    /// number. Returns the full path of the created node.
    async fn create_ephemeral_sequential(
        &self,
        prefix: &str,
        data: &[u8],
    ) -> Result<String, CoordinationError>;

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError>;

    async fn get(&self, path: &str) -> Result<Vec<u8>, CoordinationError>;

    async fn set(&self, path: &str, data: &[u8]) -> Result<(), CoordinationError>;

    /// Resolve once `path` no longer exists. Resolves at once if it is
    /// already gone.
    async fn wait_deleted(&self, path: &str) -> Result<(), CoordinationError>;
}

/// Parent of an absolute path; `/` for top-level nodes.
pub(crate) fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// Last component of a path.
pub(crate) fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Join a parent path and a child name.
pub(crate) fn join(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}
