//! drover scheduler
//!
//! Runs one scheduler replica: joins the leader election and, while leading,
//! holds the subscription to the resource manager.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use drover_scheduler::config::Config;
use drover_scheduler::filter::FilterChain;
use drover_scheduler::leader::{ElectionConfig, ZkCoordination};
use drover_scheduler::store::{SqliteStore, Store};
use drover_scheduler::{HttpTransport, Manager, PlacementPolicy, Scheduler};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first: it carries the default log level
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        master_url = %config.master_url,
        listen_addr = %config.listen_addr,
        zk_addrs = %config.zk_addrs,
        cluster = %config.cluster_name,
        data_dir = %config.data_dir,
        "Starting drover scheduler"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir))?;
    let db_path = Path::new(&config.data_dir).join("drover.db");
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("opening store at {}", db_path.display()))?,
    );

    let transport = Arc::new(HttpTransport::new(&config.master_url)?);

    let (scheduler, errors) = Scheduler::new(
        config.scheduler_config(),
        config.cluster_name.clone(),
        config.framework_info(),
        transport,
        Arc::clone(&store),
        PlacementPolicy {
            filters: FilterChain::default(),
            strategy: config.strategy.build(),
        },
    );

    let coordination = ZkCoordination::connect(config.zk_config())
        .await
        .with_context(|| format!("connecting to ZooKeeper at {}", config.zk_addrs))?;
    let election = ElectionConfig::new(config.election_path.clone(), config.listen_addr.clone());
    let manager = Manager::new(election, scheduler, errors, store, Arc::new(coordination));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut manager_handle = tokio::spawn(manager.run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            match manager_handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Manager error during shutdown"),
                Err(e) => error!(error = %e, "Manager task panicked"),
            }
        }
        result = &mut manager_handle => {
            match result {
                Ok(Ok(())) => info!("Manager exited"),
                Ok(Err(e)) => {
                    error!(error = %e, "Manager failed");
                    return Err(e.into());
                }
                Err(e) => {
                    error!(error = %e, "Manager task panicked");
                    return Err(e.into());
                }
            }
        }
    }

    info!("drover scheduler shutdown complete");
    Ok(())
}
