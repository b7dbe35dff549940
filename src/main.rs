//! VCR Node
//!
//! Boots a cloud storage manager for the partitions assigned to this node,
//! keeps retrying partitions that fail to start, and shuts every store down
//! on Ctrl-C.
//!
//! Usage: `vcr-node [config.toml]`. Without a file, configuration comes from
//! the environment (see `vcr_storage::cloud::config`).
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | VCR_HEALTH_INTERVAL_SECS | 30 | Seconds between health sweeps |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use vcr_storage::cloud::{create_storage_manager, CloudConfig, CloudStorageManager, VcrMetrics};
use vcr_storage::clustermap::{ClusterMap, ReplicaId, StaticClusterMap};
use vcr_storage::observability::{init_tracing, LogFormat};
use vcr_storage::server::{ServerErrorCode, StoreManager};

const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;
const HEALTH_INTERVAL_SECS_MIN: u64 = 1;
const HEALTH_INTERVAL_SECS_MAX: u64 = 3600;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing(LogFormat::from_env())?;

    let config = match std::env::args().nth(1) {
        Some(path) => CloudConfig::from_toml_file(&PathBuf::from(path))?,
        None => CloudConfig::from_env()?,
    };

    info!(
        hostname = %config.node.hostname,
        port = config.node.port,
        destination = %config.destination.store_type,
        partitions = config.node.partitions.len(),
        "Starting VCR node"
    );

    let metrics = Arc::new(VcrMetrics::new());
    let manager = Arc::new(create_storage_manager(&config, metrics.clone())?);
    let cluster_map = StaticClusterMap::new(
        config.node.hostname.clone(),
        config.node.port,
        config.node.partitions.iter().copied(),
    );

    let failed = manager
        .add_replicas_from_cluster_map(&cluster_map, &config.node.hostname, config.node.port)
        .await;
    if !failed.is_empty() {
        warn!(?failed, "Some partitions failed to start; will retry");
    }

    let health_interval = Duration::from_secs(
        std::env::var("VCR_HEALTH_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_HEALTH_INTERVAL_SECS)
            .clamp(HEALTH_INTERVAL_SECS_MIN, HEALTH_INTERVAL_SECS_MAX),
    );
    let replicas = cluster_map.replica_ids(&config.node.hostname, config.node.port);
    let health_task = tokio::spawn(health_loop(manager.clone(), replicas, health_interval));

    signal::ctrl_c().await?;
    info!("Shutdown signal received");

    health_task.abort();
    manager.shutdown_all().await;

    let snapshot = metrics.snapshot();
    info!(
        stores_created = snapshot.blob_stores_created,
        starts = snapshot.blob_store_starts,
        start_failures = snapshot.blob_store_start_failures,
        uploads = snapshot.blob_uploads,
        downloads = snapshot.blob_downloads,
        "VCR node stopped"
    );
    Ok(())
}

/// Periodically report partition health and retry partitions that are down
async fn health_loop(manager: Arc<CloudStorageManager>, replicas: Vec<ReplicaId>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let mut healthy = 0usize;
        for replica in &replicas {
            let partition = replica.partition_id();
            match manager.check_local_partition_status(partition, replica) {
                ServerErrorCode::NoError => healthy += 1,
                ServerErrorCode::ReplicaUnavailable => {
                    if manager.start_blob_store(partition).await {
                        info!(%partition, "Recovered partition");
                        healthy += 1;
                    }
                }
                ServerErrorCode::PartitionUnknown => {
                    warn!(%partition, "Assigned partition is not registered; re-adding");
                    if manager.add_blob_store(replica).await {
                        healthy += 1;
                    }
                }
            }
        }
        info!(healthy, total = replicas.len(), "Health sweep complete");
    }
}
