//! Leader election and failover across replicas sharing one coordination service.


use std::sync::Arc;
use std::time::Duration;

use drover_scheduler::backoff::BackoffPolicy;
use drover_scheduler::leader::{
    Coordination, CoordinationError, Coordinator, ElectionConfig, Leadership, MemoryCoordination,
    MemorySession,
};
use drover_scheduler::store::Store;
use drover_scheduler::{Manager, SchedulerError};
use harness::{eventually, fast_config, Harness, TEST_TIMEOUT};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const ROOT: &str = "/drover/leader-election";

fn election(addr: &str) -> ElectionConfig {
    ElectionConfig {
        root: ROOT.into(),
        listen_addr: addr.into(),
        poll: BackoffPolicy::constant(Duration::from_millis(10)),
    }
}

/// One election participant with its latest reported role.
struct Candidate {
    session: Arc<MemorySession>,
    role: watch::Receiver<Leadership>,
    handle: JoinHandle<Result<(), CoordinationError>>,
}

impl Candidate {
    fn start(zk: &MemoryCoordination, addr: &str, shutdown: watch::Receiver<bool>) -> Self {
        let session = Arc::new(zk.session());
        let coordinator = Coordinator::new(election(addr), session.clone());

        let (changes_tx, mut changes) = mpsc::channel(8);
        let (role_tx, role) = watch::channel(Leadership::Unknown);
        tokio::spawn(async move {
            while let Some(next) = changes.recv().await {
                role_tx.send_replace(next);
            }
        });

        Self {
            session,
            role,
            handle: tokio::spawn(coordinator.run(changes_tx, shutdown)),
        }
    }

    async fn wait_for(&mut self, expected: Leadership) {
        tokio::time::timeout(TEST_TIMEOUT, self.role.wait_for(|r| *r == expected))
            .await
            .expect("role not reached in time")
            .expect("coordinator stopped");
    }
}

fn leader(addr: &str) -> Leadership {
    Leadership::Leader { addr: addr.into() }
}

fn follower(addr: &str) -> Leadership {
    Leadership::Follower {
        leader_addr: addr.into(),
    }
}

#[tokio::test]
async fn test_single_leader_among_candidates() {
    let zk = MemoryCoordination::new();
    let (_stop, shutdown) = watch::channel(false);

    let mut a = Candidate::start(&zk, "10.0.0.1:9999", shutdown.clone());
    a.wait_for(leader("10.0.0.1:9999")).await;

    let mut b = Candidate::start(&zk, "10.0.0.2:9999", shutdown.clone());
    let mut c = Candidate::start(&zk, "10.0.0.3:9999", shutdown.clone());
    b.wait_for(follower("10.0.0.1:9999")).await;
    c.wait_for(follower("10.0.0.1:9999")).await;

    let leaders = [&a, &b, &c]
        .iter()
        .filter(|cand| cand.role.borrow().is_leader())
        .count();
    assert_eq!(leaders, 1);

    let observer = zk.session();
    let mut nodes = observer.children(ROOT).await.unwrap();
    nodes.sort();
    assert_eq!(nodes.len(), 3);
    // The leader published its address on the smallest node.
    let data = observer.get(&format!("{ROOT}/{}", nodes[0])).await.unwrap();
    assert_eq!(data, b"10.0.0.1:9999");
}

#[tokio::test]
async fn test_leader_crash_promotes_next_candidate() {
    let zk = MemoryCoordination::new();
    let (_stop, shutdown) = watch::channel(false);

    let mut a = Candidate::start(&zk, "10.0.0.1:9999", shutdown.clone());
    a.wait_for(leader("10.0.0.1:9999")).await;
    let mut b = Candidate::start(&zk, "10.0.0.2:9999", shutdown.clone());
    b.wait_for(follower("10.0.0.1:9999")).await;
    let mut c = Candidate::start(&zk, "10.0.0.3:9999", shutdown.clone());
    c.wait_for(follower("10.0.0.1:9999")).await;

    a.session.close();

    let crashed = tokio::time::timeout(TEST_TIMEOUT, a.handle).await.unwrap().unwrap();
    assert!(matches!(crashed, Err(CoordinationError::SessionExpired)));

    // The oldest surviving node takes over; the other follows it.
    b.wait_for(leader("10.0.0.2:9999")).await;
    c.wait_for(follower("10.0.0.2:9999")).await;
}

#[tokio::test]
async fn test_follower_crash_keeps_leader() {
    let zk = MemoryCoordination::new();
    let (_stop, shutdown) = watch::channel(false);

    let mut a = Candidate::start(&zk, "10.0.0.1:9999", shutdown.clone());
    a.wait_for(leader("10.0.0.1:9999")).await;
    let mut b = Candidate::start(&zk, "10.0.0.2:9999", shutdown.clone());
    b.wait_for(follower("10.0.0.1:9999")).await;

    b.session.close();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(a.role.borrow().is_leader());
    assert!(!a.handle.is_finished());
}

#[tokio::test]
async fn test_shutdown_stops_election() {
    let zk = MemoryCoordination::new();
    let (stop, shutdown) = watch::channel(false);

    let mut a = Candidate::start(&zk, "10.0.0.1:9999", shutdown);
    a.wait_for(leader("10.0.0.1:9999")).await;

    stop.send(true).unwrap();
    let result = tokio::time::timeout(TEST_TIMEOUT, a.handle).await.unwrap().unwrap();
    assert!(result.is_ok());
}

/// A manager over its own scheduler, mock transport and store.
struct Replica {
    harness: Harness,
    session: Arc<MemorySession>,
    router: Arc<drover_scheduler::api::LeaderRouter>,
    handle: JoinHandle<Result<(), SchedulerError>>,
}

impl Replica {
    fn start(zk: &MemoryCoordination, addr: &str, shutdown: watch::Receiver<bool>) -> Self {
        let mut harness = Harness::new(fast_config());
        let session = Arc::new(zk.session());

        let (_, placeholder) = mpsc::channel(1);
        let errors = std::mem::replace(&mut harness.errors, placeholder);
        let manager = Manager::new(
            election(addr),
            harness.scheduler.clone(),
            errors,
            harness.store.clone(),
            session.clone(),
        );
        let router = manager.router();

        Self {
            harness,
            session,
            router,
            handle: tokio::spawn(manager.run(shutdown)),
        }
    }

    async fn wait_subscribed(&self, subscribed: bool) {
        let scheduler = self.harness.scheduler.clone();
        eventually(move || {
            let scheduler = scheduler.clone();
            async move { scheduler.is_subscribed().await == subscribed }
        })
        .await;
    }
}

#[tokio::test]
async fn test_manager_failover_moves_subscription() {
    let zk = MemoryCoordination::new();
    let (_stop, shutdown) = watch::channel(false);

    let a = Replica::start(&zk, "10.0.0.1:9999", shutdown.clone());
    a.wait_subscribed(true).await;
    assert!(a.router.is_leader());

    let b = Replica::start(&zk, "10.0.0.2:9999", shutdown.clone());
    let router = b.router.clone();
    eventually(move || {
        let router = router.clone();
        async move { router.leader().as_deref() == Some("10.0.0.1:9999") }
    })
    .await;
    assert!(!b.router.is_leader());
    assert_eq!(b.harness.transport.subscription_count(), 0);

    a.session.close();

    let failed = tokio::time::timeout(TEST_TIMEOUT, a.handle).await.unwrap().unwrap();
    assert!(matches!(failed, Err(SchedulerError::Election(_))));
    assert!(!a.harness.scheduler.is_subscribed().await);

    b.wait_subscribed(true).await;
    assert!(b.router.is_leader());
    assert_eq!(b.harness.transport.subscription_count(), 1);

    let store = b.harness.store.clone();
    eventually(move || {
        let state = store.get_raft_state().unwrap();
        async move { state.is_some_and(|s| s.role == "leader" && s.term == 2) }
    })
    .await;
}
