//! Persistence used by the scheduler and the manager.
//!
//! The engine only needs a narrow set of records:
//! - task records (status, health, last error)
//! - the framework id assigned on first subscription
//! - the last observed election state
//! - cluster membership
//!
//! Store calls are synchronous. Callers log failures and keep going; live
//! scheduling state never depends on a write succeeding.

mod memory;
mod sqlite;

use chrono::{DateTime, Utc};
use drover_proto::{AgentId, FrameworkId, TaskId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid record: {0}")]
    Invalid(String),
}

/// Status stored for a task that could not be placed in time.
pub const STATUS_TIMEOUT: &str = "timeout";

/// Status stored for a task accepted but not yet reported on.
pub const STATUS_PENDING: &str = "pending";

/// Status stored for a launch that failed before any task status arrived.
pub const STATUS_FAILED: &str = "failed";

/// Persisted view of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
    pub ports: Vec<u64>,
    pub image: Option<String>,
    pub agent_id: Option<AgentId>,
    pub healthy: bool,
    pub status: String,
    pub err_msg: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// A fresh pending record.
    pub fn new(id: TaskId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            cpus: 0.0,
            mem: 0.0,
            disk: 0.0,
            ports: Vec::new(),
            image: None,
            agent_id: None,
            healthy: false,
            status: STATUS_PENDING.to_string(),
            err_msg: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Last observed leadership, kept across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionState {
    /// Number of leadership changes observed by this process.
    pub term: u64,
    /// `leader` or `follower`.
    pub role: String,
    pub leader_addr: String,
    pub updated_at: DateTime<Utc>,
}

/// A scheduler replica known to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub addr: String,
    pub joined_at: DateTime<Utc>,
}

/// Storage interface the scheduler core requires.
pub trait Store: Send + Sync {
    fn save_task(&self, task: &TaskRecord) -> Result<(), StoreError>;

    fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Update an existing task. Fails with `NotFound` if it was never saved.
    fn update_task(&self, task: &TaskRecord) -> Result<(), StoreError>;

    fn update_framework_id(&self, id: &FrameworkId) -> Result<(), StoreError>;

    fn get_framework_id(&self) -> Result<Option<FrameworkId>, StoreError>;

    fn save_raft_state(&self, state: &ElectionState) -> Result<(), StoreError>;

    fn get_raft_state(&self) -> Result<Option<ElectionState>, StoreError>;

    /// Record a replica. Re-adding an address refreshes it.
    fn add_node(&self, node: &NodeRecord) -> Result<(), StoreError>;

    fn get_nodes(&self) -> Result<Vec<NodeRecord>, StoreError>;
}
