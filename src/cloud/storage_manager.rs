//! Cloud Storage Manager
//!
//! Book-keeping for every partition a VCR node handles. The manager owns a
//! [`PartitionStoreRegistry`] of [`CloudBlobStore`]s that all share one
//! destination, converter and metrics sink.
//!
//! Shutdown and removal are independent: shutting a store down leaves it
//! registered, and removing it does not shut it down. Callers that want a
//! clean stop sequence the two themselves.
//!
//! Compaction and persisted stop state are local-disk concepts. The cloud
//! destination reclaims its own storage, so those operations report
//! [`StoreManagerError::Unsupported`].

use crate::cloud::blob_store::CloudBlobStore;
use crate::cloud::destination::CloudDestination;
use crate::cloud::metrics::VcrMetrics;
use crate::clustermap::{ClusterMap, PartitionId, ReplicaId};
use crate::server::{ServerErrorCode, StoreManager, StoreManagerError};
use crate::store::{PartitionStoreRegistry, Store, StoreKeyConverter};
use futures::future::join_all;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct CloudStorageManager {
    registry: PartitionStoreRegistry<CloudBlobStore>,
    destination: Arc<dyn CloudDestination>,
    converter: Option<Arc<dyn StoreKeyConverter>>,
    metrics: Arc<VcrMetrics>,
}

impl CloudStorageManager {
    pub fn new(
        destination: Arc<dyn CloudDestination>,
        converter: Option<Arc<dyn StoreKeyConverter>>,
        metrics: Arc<VcrMetrics>,
    ) -> Self {
        CloudStorageManager {
            registry: PartitionStoreRegistry::new(),
            destination,
            converter,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<VcrMetrics> {
        &self.metrics
    }

    /// Registered partitions, started or not
    pub fn partition_ids(&self) -> Vec<PartitionId> {
        self.registry.partition_ids()
    }

    /// Add every replica the cluster map assigns to `hostname:port`
    ///
    /// Starts run concurrently. Returns the partitions whose store failed to
    /// start; those remain registered and report `ReplicaUnavailable`.
    pub async fn add_replicas_from_cluster_map(
        &self,
        cluster_map: &dyn ClusterMap,
        hostname: &str,
        port: u16,
    ) -> Vec<PartitionId> {
        let replicas = cluster_map.replica_ids(hostname, port);
        info!(
            hostname,
            port,
            replicas = replicas.len(),
            "Adding replicas assigned by cluster map"
        );

        let results = join_all(replicas.iter().map(|replica| self.add_blob_store(replica))).await;

        replicas
            .iter()
            .zip(results)
            .filter(|(_, started)| !started)
            .map(|(replica, _)| replica.partition_id())
            .collect()
    }

    /// Shut down every registered store, leaving all of them registered
    pub async fn shutdown_all(&self) {
        let stores = self.registry.stores();
        info!(stores = stores.len(), "Shutting down all blob stores");
        join_all(stores.iter().map(|store| store.shutdown())).await;
    }
}

impl std::fmt::Debug for CloudStorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudStorageManager")
            .field("partitions", &self.registry.len())
            .field("destination", &self.destination)
            .finish()
    }
}

impl StoreManager for CloudStorageManager {
    type Store = CloudBlobStore;

    fn add_blob_store<'a>(
        &'a self,
        replica: &'a ReplicaId,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            let partition_id = replica.partition_id();
            self.registry.add_if_absent(partition_id, || {
                debug!(partition = %partition_id, replica = %replica, "Creating cloud blob store");
                CloudBlobStore::new(
                    partition_id,
                    self.destination.clone(),
                    self.converter.clone(),
                    self.metrics.clone(),
                )
            });
            self.start_blob_store(partition_id).await
        })
    }

    fn start_blob_store(
        &self,
        partition_id: PartitionId,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            let Some(store) = self.registry.get(partition_id) else {
                debug!(partition = %partition_id, "Start requested for unknown partition");
                return false;
            };
            match store.start().await {
                Ok(()) => true,
                Err(e) => {
                    self.metrics.record_store_start_failure();
                    error!(partition = %partition_id, error = %e, "Can't start {}", store);
                    false
                }
            }
        })
    }

    fn shutdown_blob_store(
        &self,
        partition_id: PartitionId,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            let Some(store) = self.registry.get(partition_id) else {
                debug!(partition = %partition_id, "Shutdown requested for unknown partition");
                return false;
            };
            store.shutdown().await;
            true
        })
    }

    fn remove_blob_store(&self, partition_id: PartitionId) -> bool {
        let removed = self.registry.remove(partition_id);
        if removed {
            info!(partition = %partition_id, "Removed blob store");
        }
        removed
    }

    fn get_store(&self, partition_id: PartitionId) -> Option<Arc<CloudBlobStore>> {
        self.registry
            .get(partition_id)
            .filter(|store| store.is_started())
    }

    fn check_local_partition_status(
        &self,
        partition_id: PartitionId,
        _replica: &ReplicaId,
    ) -> ServerErrorCode {
        // Assignment is decided by the cluster map, not by this node's disks:
        // a partition never assigned and one since removed look the same here.
        match self.registry.get(partition_id) {
            None => ServerErrorCode::PartitionUnknown,
            Some(store) if !store.is_started() => ServerErrorCode::ReplicaUnavailable,
            Some(_) => ServerErrorCode::NoError,
        }
    }

    fn schedule_next_for_compaction(
        &self,
        partition_id: PartitionId,
    ) -> Result<bool, StoreManagerError> {
        warn!(partition = %partition_id, "Compaction scheduling requested on a cloud backend");
        Err(StoreManagerError::Unsupported {
            operation: "schedule_next_for_compaction",
        })
    }

    fn control_compaction_for_blob_store(
        &self,
        partition_id: PartitionId,
        enabled: bool,
    ) -> Result<bool, StoreManagerError> {
        warn!(partition = %partition_id, enabled, "Compaction control requested on a cloud backend");
        Err(StoreManagerError::Unsupported {
            operation: "control_compaction_for_blob_store",
        })
    }

    fn set_blob_store_stopped_state(
        &self,
        partition_ids: &[PartitionId],
        mark_stop: bool,
    ) -> Result<Vec<PartitionId>, StoreManagerError> {
        warn!(
            partitions = partition_ids.len(),
            mark_stop,
            "Stopped-state update requested on a cloud backend"
        );
        Err(StoreManagerError::Unsupported {
            operation: "set_blob_store_stopped_state",
        })
    }
}
