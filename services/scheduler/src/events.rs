//! Task event fan-out to long-lived API clients.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use drover_proto::{AgentId, TaskId, TaskState, TaskStatus};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::SchedulerError;

/// A task status change as seen by API clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub state: TaskState,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&TaskStatus> for TaskEvent {
    fn from(status: &TaskStatus) -> Self {
        Self {
            task_id: status.task_id.clone(),
            state: status.state,
            healthy: status.healthy.unwrap_or(false),
            agent_id: status.agent_id.clone(),
            message: status.message_str().to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Registry of event clients keyed by remote address.
#[derive(Debug)]
pub struct EventManager {
    clients: RwLock<HashMap<String, mpsc::Sender<TaskEvent>>>,
    capacity: usize,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Register a client. Fails when the manager is at capacity.
    ///
    /// A second registration from the same remote replaces the first.
    pub fn subscribe(
        &self,
        remote: &str,
        sink: mpsc::Sender<TaskEvent>,
    ) -> Result<(), SchedulerError> {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        if clients.len() >= self.capacity && !clients.contains_key(remote) {
            return Err(SchedulerError::TooManyEventClients);
        }
        clients.insert(remote.to_string(), sink);
        debug!(remote, clients = clients.len(), "Event client subscribed");
        Ok(())
    }

    pub fn unsubscribe(&self, remote: &str) {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        if clients.remove(remote).is_some() {
            debug!(remote, clients = clients.len(), "Event client unsubscribed");
        }
    }

    /// Push an event to every client. Never blocks; a full client misses it.
    pub fn broadcast(&self, event: &TaskEvent) {
        let clients = self.clients.read().unwrap_or_else(PoisonError::into_inner);
        for (remote, sink) in clients.iter() {
            match sink.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(remote = %remote, task_id = %event.task_id, "Event client lagging, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(remote = %remote, "Event client gone");
                }
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_full(&self) -> bool {
        self.client_count() >= self.capacity
    }
}
