//! In-process coordination service.
//!
//! Gives the election the same guarantees a ZooKeeper ensemble would inside a
//! single process: sessions, ephemeral nodes removed when their session
//! closes, per-parent sequence numbers and deletion watches. Used by tests;
//! deployed replicas run against [`super::ZkCoordination`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use super::{basename, join, parent, Coordination, CoordinationError};

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    /// Owning session for ephemeral nodes.
    owner: Option<u64>,
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    sequences: HashMap<String, u64>,
    sessions: HashSet<u64>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                owner: None,
            },
        );
        Self {
            nodes,
            sequences: HashMap::new(),
            sessions: HashSet::new(),
        }
    }

    fn check_session(&self, session: u64) -> Result<(), CoordinationError> {
        if self.sessions.contains(&session) {
            Ok(())
        } else {
            Err(CoordinationError::SessionExpired)
        }
    }
}

struct Shared {
    tree: Mutex<Tree>,
    next_session: AtomicU64,
    /// Bumped on every node removal.
    removals: watch::Sender<u64>,
}

impl Shared {
    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared in-memory coordination tree. Clones refer to the same tree.
#[derive(Clone)]
pub struct MemoryCoordination {
    shared: Arc<Shared>,
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordination {
    pub fn new() -> Self {
        let (removals, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                tree: Mutex::new(Tree::new()),
                next_session: AtomicU64::new(1),
                removals,
            }),
        }
    }

    /// Open a new client session.
    pub fn session(&self) -> MemorySession {
        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        self.shared.tree().sessions.insert(id);
        debug!(session = id, "Coordination session opened");
        MemorySession {
            id,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of nodes in the tree, root included.
    pub fn node_count(&self) -> usize {
        self.shared.tree().nodes.len()
    }
}

/// One client session. Closing or dropping it removes its ephemeral nodes.
pub struct MemorySession {
    id: u64,
    shared: Arc<Shared>,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// End the session as a crashed process would.
    pub fn close(&self) {
        let removed = {
            let mut tree = self.shared.tree();
            if !tree.sessions.remove(&self.id) {
                return;
            }
            let before = tree.nodes.len();
            tree.nodes.retain(|_, node| node.owner != Some(self.id));
            before - tree.nodes.len()
        };

        debug!(session = self.id, removed, "Coordination session closed");
        self.shared.removals.send_modify(|v| *v += 1);
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Coordination for MemorySession {
    async fn ensure_path(&self, path: &str) -> Result<(), CoordinationError> {
        let mut tree = self.shared.tree();
        tree.check_session(self.id)?;

        let mut current = String::from("/");
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = join(&current, part);
            tree.nodes.entry(current.clone()).or_insert(Node {
                data: Vec::new(),
                owner: None,
            });
        }
        Ok(())
    }

    async fn create_ephemeral_sequential(
        &self,
        prefix: &str,
        data: &[u8],
    ) -> Result<String, CoordinationError> {
        let mut tree = self.shared.tree();
        tree.check_session(self.id)?;

        let dir = parent(prefix).to_string();
        if !tree.nodes.contains_key(&dir) {
            return Err(CoordinationError::NoNode(dir));
        }

        let seq = tree.sequences.entry(dir.clone()).or_insert(0);
        let path = join(&dir, &format!("{}{:010}", basename(prefix), *seq));
        *seq += 1;

        if tree.nodes.contains_key(&path) {
            return Err(CoordinationError::NodeExists(path));
        }
        tree.nodes.insert(
            path.clone(),
            Node {
                data: data.to_vec(),
                owner: Some(self.id),
            },
        );
        Ok(path)
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        let tree = self.shared.tree();
        tree.check_session(self.id)?;

        if !tree.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        Ok(tree
            .nodes
            .keys()
            .filter(|k| k.as_str() != "/" && parent(k) == path)
            .map(|k| basename(k).to_string())
            .collect())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, CoordinationError> {
        let tree = self.shared.tree();
        tree.check_session(self.id)?;

        tree.nodes
            .get(path)
            .map(|n| n.data.clone())
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))
    }

    async fn set(&self, path: &str, data: &[u8]) -> Result<(), CoordinationError> {
        let mut tree = self.shared.tree();
        tree.check_session(self.id)?;

        match tree.nodes.get_mut(path) {
            Some(node) => {
                node.data = data.to_vec();
                Ok(())
            }
            None => Err(CoordinationError::NoNode(path.to_string())),
        }
    }

    async fn wait_deleted(&self, path: &str) -> Result<(), CoordinationError> {
        loop {
            // Subscribe before checking so a removal in between is not missed.
            let mut removals = self.shared.removals.subscribe();
            {
                let tree = self.shared.tree();
                tree.check_session(self.id)?;
                if !tree.nodes.contains_key(path) {
                    return Ok(());
                }
            }
            if removals.changed().await.is_err() {
                return Err(CoordinationError::SessionExpired);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sequential_names_are_zero_padded_and_increasing() {
        let zk = MemoryCoordination::new();
        let s = zk.session();
        s.ensure_path("/drover/election").await.unwrap();

        let a = s.create_ephemeral_sequential("/drover/election/0", b"").await.unwrap();
        let b = s.create_ephemeral_sequential("/drover/election/0", b"").await.unwrap();
        assert_eq!(a, "/drover/election/00000000000");
        assert_eq!(b, "/drover/election/00000000001");

        let mut children = s.children("/drover/election").await.unwrap();
        children.sort();
        assert_eq!(children, vec!["00000000000", "00000000001"]);
    }

    #[tokio::test]
    async fn test_create_under_missing_parent_fails() {
        let zk = MemoryCoordination::new();
        let s = zk.session();
        assert!(matches!(
            s.create_ephemeral_sequential("/missing/0", b"").await,
            Err(CoordinationError::NoNode(_))
        ));
        assert!(matches!(
            s.children("/missing").await,
            Err(CoordinationError::NoNode(_))
        ));
    }

    #[tokio::test]
    async fn test_close_removes_ephemerals_and_wakes_watchers() {
        let zk = MemoryCoordination::new();
        let owner = zk.session();
        let watcher = zk.session();
        owner.ensure_path("/e").await.unwrap();
        let node = owner.create_ephemeral_sequential("/e/0", b"x").await.unwrap();

        let wait = {
            let node = node.clone();
            tokio::spawn(async move { watcher.wait_deleted(&node).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!wait.is_finished());

        owner.close();
        tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // Persistent parent survives.
        assert_eq!(zk.node_count(), 2);
        assert!(matches!(owner.get("/e").await, Err(CoordinationError::SessionExpired)));
    }

    #[tokio::test]
    async fn test_wait_deleted_on_missing_node_returns_at_once() {
        let zk = MemoryCoordination::new();
        let s = zk.session();
        s.wait_deleted("/nothing/here").await.unwrap();
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let zk = MemoryCoordination::new();
        let s = zk.session();
        s.ensure_path("/e").await.unwrap();
        let node = s.create_ephemeral_sequential("/e/0", b"").await.unwrap();

        assert!(s.get(&node).await.unwrap().is_empty());
        s.set(&node, b"10.0.0.1:9999").await.unwrap();
        assert_eq!(s.get(&node).await.unwrap(), b"10.0.0.1:9999");
        assert!(matches!(
            s.set("/e/nope", b"").await,
            Err(CoordinationError::NoNode(_))
        ));
    }
}
