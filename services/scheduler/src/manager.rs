//! Ties leadership to the scheduler's subscription and the API router.
//!
//! The manager runs the election, and on every role change:
//! - tells the [`LeaderRouter`] where the leader is
//! - subscribes the scheduler when this process leads, unsubscribes otherwise
//! - persists the new election state
//!
//! An election failure ends [`Manager::run`] with an error: without
//! coordination the process cannot know whether it may schedule.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, instrument, warn};

use crate::api::LeaderRouter;
use crate::error::SchedulerError;
use crate::leader::{Coordination, Coordinator, ElectionConfig, Leadership};
use crate::scheduler::Scheduler;
use crate::store::{ElectionState, NodeRecord, Store};

/// Runs one scheduler replica.
pub struct Manager {
    election: ElectionConfig,
    scheduler: Arc<Scheduler>,
    errors: mpsc::Receiver<SchedulerError>,
    router: Arc<LeaderRouter>,
    store: Arc<dyn Store>,
    coordination: Arc<dyn Coordination>,
}

impl Manager {
    pub fn new(
        election: ElectionConfig,
        scheduler: Arc<Scheduler>,
        errors: mpsc::Receiver<SchedulerError>,
        store: Arc<dyn Store>,
        coordination: Arc<dyn Coordination>,
    ) -> Self {
        let router = Arc::new(LeaderRouter::new(election.listen_addr.clone()));
        Self {
            election,
            scheduler,
            errors,
            router,
            store,
            coordination,
        }
    }

    /// Router the API layer consults for request forwarding.
    pub fn router(&self) -> Arc<LeaderRouter> {
        Arc::clone(&self.router)
    }

    /// Run until shutdown or an election failure.
    #[instrument(skip_all, fields(listen_addr = %self.election.listen_addr))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SchedulerError> {
        self.register_node();

        let (changes_tx, mut changes) = mpsc::channel(8);
        let coordinator = Coordinator::new(self.election.clone(), Arc::clone(&self.coordination));
        let mut election = tokio::spawn(coordinator.run(changes_tx, shutdown.clone()));

        let mut term = match self.store.get_raft_state() {
            Ok(Some(state)) => {
                info!(
                    term = state.term,
                    role = %state.role,
                    leader = %state.leader_addr,
                    "Previous election state"
                );
                state.term
            }
            Ok(None) => 0,
            Err(e) => {
                warn!(error = %e, "Failed to load election state");
                0
            }
        };

        let result = loop {
            tokio::select! {
                Some(role) = changes.recv() => {
                    term += 1;
                    self.apply(&role, term).await;
                }
                Some(err) = self.errors.recv() => {
                    // Already logged at the source; keep the loop going.
                    warn!(error = %err, "Scheduler reported error");
                }
                joined = &mut election => {
                    break match joined {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => {
                            error!(error = %e, "Leader election failed");
                            Err(SchedulerError::Election(e))
                        }
                        Err(e) => Err(SchedulerError::Internal(format!("election task: {e}"))),
                    };
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Manager shutting down");
                        break Ok(());
                    }
                }
            }
        };

        self.scheduler.unsubscribe().await;
        result
    }

    async fn apply(&self, role: &Leadership, term: u64) {
        match role {
            Leadership::Leader { addr } => {
                info!(term, "This replica is now the leader");
                self.router.update(addr);
                if let Err(e) = self.scheduler.subscribe().await {
                    error!(error = %e, "Subscribe after election failed");
                }
            }
            Leadership::Follower { leader_addr } => {
                info!(term, leader = %leader_addr, "This replica is now a follower");
                self.router.update(leader_addr);
                self.scheduler.unsubscribe().await;
            }
            Leadership::Unknown => return,
        }

        let state = ElectionState {
            term,
            role: role.role().to_string(),
            leader_addr: role.leader_addr().unwrap_or_default().to_string(),
            updated_at: Utc::now(),
        };
        if let Err(e) = self.store.save_raft_state(&state) {
            error!(error = %e, "Failed to persist election state");
        }
    }

    fn register_node(&self) {
        let node = NodeRecord {
            addr: self.election.listen_addr.clone(),
            joined_at: Utc::now(),
        };
        if let Err(e) = self.store.add_node(&node) {
            warn!(error = %e, "Failed to record cluster membership");
        }

        match self.store.get_nodes() {
            Ok(nodes) => {
                let addrs: Vec<&str> = nodes.iter().map(|n| n.addr.as_str()).collect();
                info!(nodes = ?addrs, "Known scheduler replicas");
            }
            Err(e) => warn!(error = %e, "Failed to list cluster members"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::config::SchedulerConfig;
    use crate::leader::MemoryCoordination;
    use crate::scheduler::PlacementPolicy;
    use crate::store::MemoryStore;
    use crate::transport::MockTransport;
    use drover_proto::FrameworkInfo;
    use std::time::Duration;

    #[tokio::test]
    async fn test_leader_subscribes_and_persists_state() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        let (scheduler, errors) = Scheduler::new(
            SchedulerConfig::default(),
            "test",
            FrameworkInfo::default(),
            transport.clone(),
            store.clone(),
            PlacementPolicy::default(),
        );

        let zk = MemoryCoordination::new();
        let election = ElectionConfig {
            root: "/drover/leader-election".into(),
            listen_addr: "10.0.0.1:9999".into(),
            poll: BackoffPolicy::constant(Duration::from_millis(10)),
        };
        let manager = Manager::new(election, scheduler.clone(), errors, store.clone(), Arc::new(zk.session()));
        let router = manager.router();

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(manager.run(stop_rx));

        tokio::time::timeout(Duration::from_secs(2), async {
            while !scheduler.is_subscribed().await || store.get_raft_state().unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(router.is_leader());
        assert_eq!(transport.subscription_count(), 1);

        let state = store.get_raft_state().unwrap().unwrap();
        assert_eq!(state.role, "leader");
        assert_eq!(state.term, 1);
        assert_eq!(store.get_nodes().unwrap().len(), 1);

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert!(!scheduler.is_subscribed().await);
    }

    #[tokio::test]
    async fn test_leader_retries_failed_subscribe() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_next_subscribes(3);
        let store = Arc::new(MemoryStore::new());
        let config = SchedulerConfig {
            resubscribe_backoff: BackoffPolicy::constant(Duration::from_millis(10)),
            ..SchedulerConfig::default()
        };
        let (scheduler, errors) = Scheduler::new(
            config,
            "test",
            FrameworkInfo::default(),
            transport.clone(),
            store.clone(),
            PlacementPolicy::default(),
        );

        let zk = MemoryCoordination::new();
        let election = ElectionConfig {
            root: "/drover/leader-election".into(),
            listen_addr: "10.0.0.1:9999".into(),
            poll: BackoffPolicy::constant(Duration::from_millis(10)),
        };
        let manager = Manager::new(election, scheduler.clone(), errors, store, Arc::new(zk.session()));

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(manager.run(stop_rx));

        tokio::time::timeout(Duration::from_secs(2), async {
            while !transport.is_streaming() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(transport.calls_of("SUBSCRIBE").len(), 4);
        assert_eq!(transport.subscription_count(), 1);
        assert!(scheduler.is_subscribed().await);

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert!(!transport.is_streaming());
    }
}
