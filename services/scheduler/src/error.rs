//! Scheduler error types.

use drover_proto::{OfferId, TaskId, TaskState};
use thiserror::Error;

use crate::leader::CoordinationError;
use crate::store::StoreError;
use crate::transport::TransportError;

/// Errors surfaced by the scheduler engine and the manager.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No agent offered enough resources within the resource wait. Retryable.
    #[error("resource not enough")]
    ResourceTimeout,

    /// The task never reached a terminal state, even after reconciliation.
    #[error("task {task_id} create timeout after {attempts} reconciliation(s)")]
    CreationTimeout { task_id: TaskId, attempts: u32 },

    /// The task reached a failure-class state.
    #[error("task {task_id} {state}: {message} (reason={reason}, source={origin}, healthy={healthy})")]
    TaskTerminal {
        task_id: TaskId,
        state: TaskState,
        reason: String,
        message: String,
        origin: String,
        healthy: bool,
    },

    /// A killed task did not report a terminal state in time.
    #[error("task {0} kill timeout")]
    KillTimeout(TaskId),

    /// The task's update channel went away before a terminal state arrived.
    #[error("task {0} abandoned before completion")]
    TaskAbandoned(TaskId),

    /// An offer chosen for placement was no longer in the registry.
    #[error("offer {offer_id} missing from registry at accept time")]
    ConsistencyViolation { offer_id: OfferId },

    /// The task specification cannot be turned into a launch descriptor.
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// `subscribe_event` was called while the event manager is at capacity.
    #[error("too many event clients")]
    TooManyEventClients,

    /// Waiting on the event bus timed out.
    #[error("timed out waiting for event")]
    EventTimeout,

    /// The resource manager reported an ERROR event on the stream.
    #[error("resource manager error: {0}")]
    Remote(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("election failed: {0}")]
    Election(#[from] CoordinationError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Returns true if the caller may retry the operation as is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ResourceTimeout | Self::EventTimeout)
    }
}
