//! The election loop.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use super::{basename, join, Coordination, CoordinationError, Leadership};
use crate::backoff::BackoffPolicy;

/// Election settings.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Election root path.
    pub root: String,

    /// Address published when this process leads.
    pub listen_addr: String,

    /// Delay between reads of a leader node that has no address yet.
    pub poll: BackoffPolicy,
}

impl ElectionConfig {
    pub fn new(root: impl Into<String>, listen_addr: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            listen_addr: listen_addr.into(),
            poll: BackoffPolicy::constant(std::time::Duration::from_secs(1)),
        }
    }
}

/// Runs the election for one process and reports role changes.
pub struct Coordinator {
    config: ElectionConfig,
    coordination: Arc<dyn Coordination>,
    current: Leadership,
}

impl Coordinator {
    pub fn new(config: ElectionConfig, coordination: Arc<dyn Coordination>) -> Self {
        Self {
            config,
            coordination,
            current: Leadership::Unknown,
        }
    }

    /// Join the election and keep re-electing until shutdown.
    ///
    /// Every role change is sent on `changes`. Returns an error when the
    /// coordination service fails; the caller must then stop acting on the
    /// last reported role.
    #[instrument(skip_all, fields(root = %self.config.root))]
    pub async fn run(
        mut self,
        changes: mpsc::Sender<Leadership>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), CoordinationError> {
        let root = self.config.root.clone();
        self.coordination.ensure_path(&root).await?;

        let node = self
            .coordination
            .create_ephemeral_sequential(&join(&root, "0"), b"")
            .await?;
        info!(node = %node, "Joined leader election");

        loop {
            let watched = tokio::select! {
                result = self.elect(&node, &changes) => result?,
                _ = stopped(&mut shutdown) => break,
            };

            debug!(leader_node = %watched, "Watching leader node");
            tokio::select! {
                result = self.coordination.wait_deleted(&watched) => {
                    result?;
                    info!(leader_node = %watched, "Leader node gone, re-electing");
                }
                _ = stopped(&mut shutdown) => break,
            }
        }

        info!("Leader election stopped");
        Ok(())
    }

    /// One election round. Returns the path of the leader's node.
    async fn elect(
        &mut self,
        node: &str,
        changes: &mpsc::Sender<Leadership>,
    ) -> Result<String, CoordinationError> {
        let root = &self.config.root;
        let own = basename(node);

        loop {
            let mut children = self.coordination.children(root).await?;
            children.sort_by(|a, b| sequence(a).cmp(&sequence(b)).then_with(|| a.cmp(b)));

            if !children.iter().any(|c| c == own) {
                return Err(CoordinationError::NodeLost(node.to_string()));
            }
            let leader_node = join(root, &children[0]);

            if children[0] == own {
                self.coordination
                    .set(node, self.config.listen_addr.as_bytes())
                    .await?;
                self.transition(
                    Leadership::Leader {
                        addr: self.config.listen_addr.clone(),
                    },
                    changes,
                )
                .await;
                return Ok(leader_node);
            }

            match self.leader_address(&leader_node).await {
                Ok(leader_addr) => {
                    self.transition(Leadership::Follower { leader_addr }, changes)
                        .await;
                    return Ok(leader_node);
                }
                Err(CoordinationError::NoNode(_)) => {
                    debug!(leader_node = %leader_node, "Leader node vanished before publishing, re-electing");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read the leader's address, waiting until it has published one.
    async fn leader_address(&self, leader_node: &str) -> Result<String, CoordinationError> {
        let mut attempt = 0u32;
        loop {
            let data = self.coordination.get(leader_node).await?;
            if !data.is_empty() {
                return Ok(String::from_utf8_lossy(&data).into_owned());
            }

            let delay = self.config.poll.delay(attempt);
            debug!(leader_node = %leader_node, attempt, delay_ms = delay.as_millis() as u64, "Leader address not published yet");
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    async fn transition(&mut self, next: Leadership, changes: &mpsc::Sender<Leadership>) {
        if next == self.current {
            return;
        }

        info!(
            from = self.current.role(),
            to = next.role(),
            leader = next.leader_addr().unwrap_or_default(),
            "Leadership changed"
        );
        self.current = next.clone();

        if changes.send(next).await.is_err() {
            warn!("Leadership receiver dropped");
        }
    }
}

/// Sequence number of an election node name.
fn sequence(name: &str) -> u64 {
    let digits = name.len().saturating_sub(10);
    name.get(digits..)
        .and_then(|s| s.parse().ok())
        .unwrap_or(u64::MAX)
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also means stop.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leader::MemoryCoordination;
    use std::time::Duration;

    fn config(addr: &str) -> ElectionConfig {
        ElectionConfig {
            root: "/drover/leader-election".into(),
            listen_addr: addr.into(),
            poll: BackoffPolicy::constant(Duration::from_millis(10)),
        }
    }

    #[test]
    fn test_sequence_parsing() {
        assert_eq!(sequence("00000000042"), 42);
        assert_eq!(sequence("x"), u64::MAX);
    }

    #[tokio::test]
    async fn test_single_candidate_becomes_leader() {
        let zk = MemoryCoordination::new();
        let session: Arc<dyn Coordination> = Arc::new(zk.session());
        let (tx, mut rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(Coordinator::new(config("a:1"), session.clone()).run(tx, stop_rx));

        let role = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(role, Leadership::Leader { addr: "a:1".into() });

        let children = session.children("/drover/leader-election").await.unwrap();
        assert_eq!(children.len(), 1);
        let data = session
            .get(&format!("/drover/leader-election/{}", children[0]))
            .await
            .unwrap();
        assert_eq!(data, b"a:1");

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_follower_learns_leader_address() {
        let zk = MemoryCoordination::new();
        let (stop_tx, stop_rx) = watch::channel(false);

        let (tx_a, mut rx_a) = mpsc::channel(4);
        let a: Arc<dyn Coordination> = Arc::new(zk.session());
        tokio::spawn(Coordinator::new(config("a:1"), a).run(tx_a, stop_rx.clone()));
        assert!(rx_a.recv().await.unwrap().is_leader());

        let (tx_b, mut rx_b) = mpsc::channel(4);
        let b: Arc<dyn Coordination> = Arc::new(zk.session());
        tokio::spawn(Coordinator::new(config("b:2"), b).run(tx_b, stop_rx));

        let role = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            role,
            Leadership::Follower {
                leader_addr: "a:1".into()
            }
        );

        stop_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_expired_session_is_fatal() {
        let zk = MemoryCoordination::new();
        let session = Arc::new(zk.session());
        let (tx, mut rx) = mpsc::channel(4);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(
            Coordinator::new(config("a:1"), session.clone() as Arc<dyn Coordination>)
                .run(tx, stop_rx),
        );
        assert!(rx.recv().await.unwrap().is_leader());

        session.close();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(CoordinationError::SessionExpired)));
    }
}
