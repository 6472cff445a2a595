//! Configuration for the drover scheduler.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use drover_proto::{Capability, CapabilityType, FrameworkInfo};

use crate::backoff::BackoffPolicy;
use crate::leader::ZkConfig;
use crate::strategy::StrategyKind;

/// Process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Resource manager base URL.
    pub master_url: String,

    /// Address published in the election node when this process leads.
    pub listen_addr: String,

    /// Cluster name reported to API clients.
    pub cluster_name: String,

    /// Data directory for the local store.
    pub data_dir: String,

    /// Election root path in the coordination service.
    pub election_path: String,

    /// ZooKeeper ensemble, `host:port` pairs separated by commas.
    pub zk_addrs: String,

    /// Seconds to wait for the first ZooKeeper connection.
    pub zk_connect_timeout_secs: u64,

    pub framework_name: String,
    pub framework_user: String,
    pub framework_principal: String,

    /// Failover timeout in seconds.
    pub failover_timeout_secs: u64,

    pub resource_timeout_secs: u64,
    pub creation_timeout_secs: u64,
    pub reconnect_duration_secs: u64,

    /// Maximum concurrent `subscribe_event` clients.
    pub max_event_clients: usize,

    /// Placement strategy.
    pub strategy: StrategyKind,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let master_url = std::env::var("DROVER_MASTER_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:5050".to_string());

        let listen_addr =
            std::env::var("DROVER_LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:9999".to_string());

        let cluster_name =
            std::env::var("DROVER_CLUSTER_NAME").unwrap_or_else(|_| "none".to_string());

        let data_dir =
            std::env::var("DROVER_DATA_DIR").unwrap_or_else(|_| "/var/lib/drover".to_string());

        let election_path = std::env::var("DROVER_ELECTION_PATH")
            .unwrap_or_else(|_| "/drover/leader-election".to_string());
        if !election_path.starts_with('/') {
            anyhow::bail!("DROVER_ELECTION_PATH must be absolute, got {election_path:?}");
        }

        let zk_addrs =
            std::env::var("DROVER_ZK_ADDRS").unwrap_or_else(|_| "127.0.0.1:2181".to_string());
        if zk_addrs.trim().is_empty() {
            anyhow::bail!("DROVER_ZK_ADDRS must name at least one server");
        }
        let zk_connect_timeout_secs = env_parse("DROVER_ZK_CONNECT_TIMEOUT", 10)?;

        let framework_name =
            std::env::var("DROVER_FRAMEWORK_NAME").unwrap_or_else(|_| "drover".to_string());
        let framework_user =
            std::env::var("DROVER_FRAMEWORK_USER").unwrap_or_else(|_| "root".to_string());
        let framework_principal =
            std::env::var("DROVER_FRAMEWORK_PRINCIPAL").unwrap_or_else(|_| "drover".to_string());

        let failover_timeout_secs = env_parse("DROVER_FAILOVER_TIMEOUT", 7 * 24 * 60 * 60)?;
        let resource_timeout_secs = env_parse("DROVER_RESOURCE_TIMEOUT", 10)?;
        let creation_timeout_secs = env_parse("DROVER_CREATION_TIMEOUT", 300)?;
        let reconnect_duration_secs = env_parse("DROVER_RECONNECT_DURATION", 20)?;
        let max_event_clients = env_parse("DROVER_MAX_EVENT_CLIENTS", 100)?;

        let strategy = match std::env::var("DROVER_STRATEGY") {
            Ok(s) => s
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("DROVER_STRATEGY")?,
            Err(_) => StrategyKind::Random,
        };

        let log_level = std::env::var("DROVER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            master_url,
            listen_addr,
            cluster_name,
            data_dir,
            election_path,
            zk_addrs,
            zk_connect_timeout_secs,
            framework_name,
            framework_user,
            framework_principal,
            failover_timeout_secs,
            resource_timeout_secs,
            creation_timeout_secs,
            reconnect_duration_secs,
            max_event_clients,
            strategy,
            log_level,
        })
    }

    /// Timing knobs for the scheduler engine.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            resource_timeout: Duration::from_secs(self.resource_timeout_secs),
            creation_timeout: Duration::from_secs(self.creation_timeout_secs),
            reconnect_duration: Duration::from_secs(self.reconnect_duration_secs),
            max_event_clients: self.max_event_clients,
            ..SchedulerConfig::default()
        }
    }

    /// Connection settings for the ZooKeeper ensemble.
    pub fn zk_config(&self) -> ZkConfig {
        ZkConfig {
            connect_timeout: Duration::from_secs(self.zk_connect_timeout_secs),
            ..ZkConfig::new(self.zk_addrs.clone())
        }
    }

    /// Framework identity used on SUBSCRIBE.
    pub fn framework_info(&self) -> FrameworkInfo {
        FrameworkInfo {
            id: None,
            user: self.framework_user.clone(),
            name: self.framework_name.clone(),
            principal: Some(self.framework_principal.clone()),
            failover_timeout: Some(self.failover_timeout_secs as f64),
            checkpoint: Some(false),
            hostname: Some(local_hostname()),
            capabilities: vec![
                Capability {
                    kind: CapabilityType::PartitionAware,
                },
                Capability {
                    kind: CapabilityType::TaskKillingState,
                },
            ],
        }
    }
}

/// Scheduler engine configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long a launch waits for a suitable agent.
    pub resource_timeout: Duration,

    /// How long a launch waits for a status before reconciling.
    pub creation_timeout: Duration,

    /// Resubscribe when no event arrives for this long.
    pub reconnect_duration: Duration,

    /// Reconciliation rounds before a launch fails with a creation timeout.
    pub max_reconcile_attempts: u32,

    /// `refuse_seconds` attached to ACCEPT and DECLINE.
    pub refuse_seconds: f64,

    /// Backoff between failed resubscription attempts.
    pub resubscribe_backoff: BackoffPolicy,

    /// Mailbox size of each event bus subscriber.
    pub bus_buffer: usize,

    /// Per-subscriber delivery timeout on the event bus.
    pub bus_send_timeout: Duration,

    /// Maximum concurrent `subscribe_event` clients.
    pub max_event_clients: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            resource_timeout: Duration::from_secs(10),
            creation_timeout: Duration::from_secs(300),
            reconnect_duration: Duration::from_secs(20),
            max_reconcile_attempts: 3,
            refuse_seconds: 1.0,
            resubscribe_backoff: BackoffPolicy::default(),
            bus_buffer: 1024,
            bus_send_timeout: Duration::from_secs(5),
            max_event_clients: 100,
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}")),
        Err(_) => Ok(default),
    }
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}
