//! Coordination backed by a ZooKeeper ensemble.
//!
//! The client reconnects on its own while the session is alive. Calls that
//! fail with a connection loss in that window are retried with backoff; an
//! expired or closed session is final and surfaces as
//! [`CoordinationError::SessionExpired`], which ends the election.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use zookeeper_client as zk;

use super::{Coordination, CoordinationError};
use crate::backoff::BackoffPolicy;

/// Connection settings for [`ZkCoordination`].
#[derive(Debug, Clone)]
pub struct ZkConfig {
    /// Comma-separated `host:port` list, optionally followed by a chroot.
    pub addrs: String,

    /// How long to wait for the first connection.
    pub connect_timeout: Duration,

    /// Backoff between retries of a call that lost its connection.
    pub retry: BackoffPolicy,

    /// Retries per call before giving up with `Unavailable`.
    pub max_retries: u32,
}

impl ZkConfig {
    pub fn new(addrs: impl Into<String>) -> Self {
        Self {
            addrs: addrs.into(),
            connect_timeout: Duration::from_secs(10),
            retry: BackoffPolicy::default(),
            max_retries: 5,
        }
    }
}

/// Session state as seen by the session monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Session {
    Connected,
    Reconnecting,
    Ended,
}

/// One ZooKeeper session.
pub struct ZkCoordination {
    client: zk::Client,
    config: ZkConfig,
    session: watch::Receiver<Session>,
}

impl ZkCoordination {
    /// Connect to the ensemble and start watching the session.
    pub async fn connect(config: ZkConfig) -> Result<Self, CoordinationError> {
        info!(addrs = %config.addrs, "Connecting to ZooKeeper");

        let connect = zk::Client::connect(&config.addrs);
        let client = tokio::time::timeout(config.connect_timeout, connect)
            .await
            .map_err(|_| {
                CoordinationError::Unavailable(format!(
                    "no connection to {} within {}s",
                    config.addrs,
                    config.connect_timeout.as_secs_f64()
                ))
            })?
            .map_err(|e| CoordinationError::Unavailable(format!("{}: {e}", config.addrs)))?;
        info!(addrs = %config.addrs, "Connected to ZooKeeper");

        let (session_tx, session) = watch::channel(Session::Connected);
        tokio::spawn(monitor_session(client.state_watcher(), session_tx));

        Ok(Self {
            client,
            config,
            session,
        })
    }

    fn check_session(&self) -> Result<(), CoordinationError> {
        if *self.session.borrow() == Session::Ended {
            return Err(CoordinationError::SessionExpired);
        }
        Ok(())
    }

    /// Run `call`, retrying while the connection is lost and the session lives.
    async fn retry<T, F, Fut>(
        &self,
        op: &'static str,
        path: &str,
        call: F,
    ) -> Result<T, CoordinationError>
    where
        F: Fn() -> Fut + Send,
        Fut: Future<Output = Result<T, zk::Error>> + Send,
        T: Send,
    {
        let mut attempt = 0u32;
        loop {
            self.check_session()?;

            match call().await {
                Ok(value) => return Ok(value),
                Err(zk::Error::ConnectionLoss) if attempt < self.config.max_retries => {
                    let delay = self.config.retry.delay(attempt);
                    warn!(
                        op,
                        path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "ZooKeeper connection lost, retrying"
                    );
                    attempt += 1;

                    let mut session = self.session.clone();
                    tokio::select! {
                        _ = session.wait_for(|s| *s == Session::Ended) => {
                            return Err(CoordinationError::SessionExpired);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(map_error(e, path)),
            }
        }
    }
}

#[async_trait]
impl Coordination for ZkCoordination {
    async fn ensure_path(&self, path: &str) -> Result<(), CoordinationError> {
        let client = &self.client;
        let options = zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all());
        let options = &options;

        for node in ancestors(path) {
            let node = node.as_str();
            let created = self
                .retry("create", node, move || client.create(node, &[], options))
                .await;
            match created {
                Ok(_) => debug!(path = node, "Created node"),
                Err(CoordinationError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn create_ephemeral_sequential(
        &self,
        prefix: &str,
        data: &[u8],
    ) -> Result<String, CoordinationError> {
        self.check_session()?;

        // Not retried: a create that lost its reply may already exist, and a
        // second attempt would leave an orphan node in this session.
        let options = zk::CreateMode::EphemeralSequential.with_acls(zk::Acls::anyone_all());
        let (_, sequence) = self
            .client
            .create(prefix, data, &options)
            .await
            .map_err(|e| map_error(e, prefix))?;

        Ok(format!("{prefix}{sequence}"))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        let client = &self.client;
        self.retry("list_children", path, move || client.list_children(path))
            .await
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, CoordinationError> {
        let client = &self.client;
        let (data, _) = self
            .retry("get_data", path, move || client.get_data(path))
            .await?;
        Ok(data)
    }

    async fn set(&self, path: &str, data: &[u8]) -> Result<(), CoordinationError> {
        let client = &self.client;
        self.retry("set_data", path, move || client.set_data(path, data, None))
            .await?;
        Ok(())
    }

    async fn wait_deleted(&self, path: &str) -> Result<(), CoordinationError> {
        let client = &self.client;
        loop {
            let (stat, watcher) = self
                .retry("check_and_watch_stat", path, move || {
                    client.check_and_watch_stat(path)
                })
                .await?;
            if stat.is_none() {
                return Ok(());
            }

            let mut session = self.session.clone();
            let event = tokio::select! {
                event = watcher.changed() => event,
                _ = session.wait_for(|s| *s == Session::Ended) => {
                    return Err(CoordinationError::SessionExpired);
                }
            };

            match event.event_type {
                zk::EventType::NodeDeleted => return Ok(()),
                zk::EventType::Session => return Err(CoordinationError::SessionExpired),
                // Data changes re-arm the watch.
                other => debug!(path, event = ?other, "Watched node changed"),
            }
        }
    }
}

async fn monitor_session(mut states: zk::StateWatcher, session: watch::Sender<Session>) {
    loop {
        let state = states.changed().await;
        match state {
            zk::SessionState::SyncConnected | zk::SessionState::ConnectedReadOnly => {
                info!(state = ?state, "ZooKeeper session connected");
                session.send_replace(Session::Connected);
            }
            zk::SessionState::Disconnected => {
                warn!("ZooKeeper connection lost, client is reconnecting");
                session.send_replace(Session::Reconnecting);
            }
            other => {
                error!(state = ?other, "ZooKeeper session ended");
                session.send_replace(Session::Ended);
                return;
            }
        }
    }
}

fn map_error(err: zk::Error, path: &str) -> CoordinationError {
    match err {
        zk::Error::NoNode => CoordinationError::NoNode(path.to_string()),
        zk::Error::NodeExists => CoordinationError::NodeExists(path.to_string()),
        zk::Error::SessionExpired | zk::Error::ClientClosed => CoordinationError::SessionExpired,
        other => CoordinationError::Unavailable(format!("{path}: {other}")),
    }
}

/// Every proper prefix of `path` plus the path itself, shortest first.
fn ancestors(path: &str) -> Vec<String> {
    let mut current = String::new();
    path.split('/')
        .filter(|part| !part.is_empty())
        .map(|part| {
            current.push('/');
            current.push_str(part);
            current.clone()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/drover/leader-election", &["/drover", "/drover/leader-election"])]
    #[case("/drover", &["/drover"])]
    #[case("/a//b/", &["/a", "/a/b"])]
    #[case("/", &[])]
    fn test_ancestors(#[case] path: &str, #[case] expected: &[&str]) {
        assert_eq!(ancestors(path), expected);
    }

    #[test]
    fn test_map_error() {
        assert!(matches!(
            map_error(zk::Error::NoNode, "/a"),
            CoordinationError::NoNode(p) if p == "/a"
        ));
        assert!(matches!(
            map_error(zk::Error::NodeExists, "/a"),
            CoordinationError::NodeExists(p) if p == "/a"
        ));
        assert!(matches!(
            map_error(zk::Error::SessionExpired, "/a"),
            CoordinationError::SessionExpired
        ));
        assert!(matches!(
            map_error(zk::Error::ClientClosed, "/a"),
            CoordinationError::SessionExpired
        ));
        assert!(matches!(
            map_error(zk::Error::ConnectionLoss, "/a"),
            CoordinationError::Unavailable(msg) if msg.starts_with("/a: ")
        ));
    }

    #[tokio::test]
    async fn test_connect_times_out_without_ensemble() {
        let config = ZkConfig {
            connect_timeout: Duration::from_millis(200),
            ..ZkConfig::new("127.0.0.1:1")
        };

        let result = ZkCoordination::connect(config).await;
        assert!(matches!(result, Err(CoordinationError::Unavailable(_))));
    }
}
