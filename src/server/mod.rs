//! Store Manager Contract
//!
//! The interface cluster-membership handlers and request handlers use to
//! drive the partitions on this node, plus the health codes it reports.
//!
//! Per-partition faults never cross this boundary as errors: a missing
//! partition or a failed start comes back as `false` / `None`. The only
//! error a manager returns is [`StoreManagerError::Unsupported`], for
//! operations its backend has no notion of.

use crate::clustermap::{PartitionId, ReplicaId};
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Cluster-visible serviceability of a replica, from this node's view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerErrorCode {
    /// Partition is registered and started
    NoError,
    /// Partition is not assigned to this node; try another replica
    PartitionUnknown,
    /// Partition is assigned but not serving; retry later
    ReplicaUnavailable,
}

impl ServerErrorCode {
    /// Whether a caller should retry against the same node
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServerErrorCode::ReplicaUnavailable)
    }
}

impl fmt::Display for ServerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerErrorCode::NoError => f.write_str("No_Error"),
            ServerErrorCode::PartitionUnknown => f.write_str("Partition_Unknown"),
            ServerErrorCode::ReplicaUnavailable => f.write_str("Replica_Unavailable"),
        }
    }
}

/// Error type for store manager operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreManagerError {
    /// The operation does not exist for this storage backend
    Unsupported { operation: &'static str },
}

impl fmt::Display for StoreManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreManagerError::Unsupported { operation } => {
                write!(f, "Operation not supported for this backend: {}", operation)
            }
        }
    }
}

impl std::error::Error for StoreManagerError {}

/// Lifecycle and health operations over the partitions on this node
///
/// Implementations must be safe to call from many tasks at once.
pub trait StoreManager: Send + Sync {
    type Store: Store;

    /// Register a store for the replica's partition if absent, then start it
    fn add_blob_store<'a>(
        &'a self,
        replica: &'a ReplicaId,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

    /// Start a registered store; false if absent or the start failed
    fn start_blob_store(
        &self,
        partition_id: PartitionId,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;

    /// Shut down a registered store, keeping it registered; false if absent
    fn shutdown_blob_store(
        &self,
        partition_id: PartitionId,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;

    /// Detach a store from this node without shutting it down
    fn remove_blob_store(&self, partition_id: PartitionId) -> bool;

    /// The store for `partition_id`, only if registered and started
    fn get_store(&self, partition_id: PartitionId) -> Option<Arc<Self::Store>>;

    fn check_local_partition_status(
        &self,
        partition_id: PartitionId,
        replica: &ReplicaId,
    ) -> ServerErrorCode;

    fn schedule_next_for_compaction(
        &self,
        partition_id: PartitionId,
    ) -> Result<bool, StoreManagerError>;

    fn control_compaction_for_blob_store(
        &self,
        partition_id: PartitionId,
        enabled: bool,
    ) -> Result<bool, StoreManagerError>;

    /// Persist the stopped state of the given partitions, returning those
    /// that could not be updated
    fn set_blob_store_stopped_state(
        &self,
        partition_ids: &[PartitionId],
        mark_stop: bool,
    ) -> Result<Vec<PartitionId>, StoreManagerError>;
}
