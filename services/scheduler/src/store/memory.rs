//! In-memory store for tests and single-process runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use drover_proto::{FrameworkId, TaskId};

use super::{ElectionState, NodeRecord, Store, StoreError, TaskRecord};

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<TaskId, TaskRecord>,
    framework_id: Option<FrameworkId>,
    election: Option<ElectionState>,
    nodes: BTreeMap<String, NodeRecord>,
}

/// Store backed by process memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn task_count(&self) -> usize {
        self.lock().tasks.len()
    }
}

impl Store for MemoryStore {
    fn save_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        self.lock().tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.lock().tasks.get(id).cloned())
    }

    fn update_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match inner.tasks.get_mut(&task.id) {
            Some(existing) => {
                *existing = task.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(task.id.to_string())),
        }
    }

    fn update_framework_id(&self, id: &FrameworkId) -> Result<(), StoreError> {
        self.lock().framework_id = Some(id.clone());
        Ok(())
    }

    fn get_framework_id(&self) -> Result<Option<FrameworkId>, StoreError> {
        Ok(self.lock().framework_id.clone())
    }

    fn save_raft_state(&self, state: &ElectionState) -> Result<(), StoreError> {
        self.lock().election = Some(state.clone());
        Ok(())
    }

    fn get_raft_state(&self) -> Result<Option<ElectionState>, StoreError> {
        Ok(self.lock().election.clone())
    }

    fn add_node(&self, node: &NodeRecord) -> Result<(), StoreError> {
        self.lock().nodes.insert(node.addr.clone(), node.clone());
        Ok(())
    }

    fn get_nodes(&self) -> Result<Vec<NodeRecord>, StoreError> {
        Ok(self.lock().nodes.values().cloned().collect())
    }
}
