//! Cluster Map
//!
//! Identities handed to this node by the cluster topology layer. The storage
//! manager never discovers topology itself; it only consumes the partitions
//! and replicas a [`ClusterMap`] reports.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Globally unique identifier of a storage partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u64);

impl PartitionId {
    pub fn new(id: u64) -> Self {
        PartitionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition-{}", self.0)
    }
}

/// One placement of a partition on a specific data node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaId {
    partition_id: PartitionId,
    /// Hostname of the data node holding the replica
    pub hostname: String,
    /// Port of the data node holding the replica
    pub port: u16,
    /// Mount path on the data node (cloud replicas use a virtual path)
    pub mount_path: String,
}

impl ReplicaId {
    pub fn new(
        partition_id: PartitionId,
        hostname: impl Into<String>,
        port: u16,
        mount_path: impl Into<String>,
    ) -> Self {
        ReplicaId {
            partition_id,
            hostname: hostname.into(),
            port,
            mount_path: mount_path.into(),
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}{}",
            self.partition_id, self.hostname, self.port, self.mount_path
        )
    }
}

/// Read-only view of cluster topology
pub trait ClusterMap: Send + Sync {
    /// Replicas assigned to the data node at `hostname:port`
    fn replica_ids(&self, hostname: &str, port: u16) -> Vec<ReplicaId>;

    /// Look up a partition known to the cluster
    fn partition(&self, id: u64) -> Option<PartitionId>;
}

// ============================================================================
// StaticClusterMap - configuration-driven topology
// ============================================================================

/// Cluster map built from a fixed partition assignment
///
/// Every listed partition is assigned to the single node the map was built
/// for. Queries for any other node return nothing.
#[derive(Debug, Clone)]
pub struct StaticClusterMap {
    hostname: String,
    port: u16,
    mount_path: String,
    partitions: BTreeSet<PartitionId>,
}

impl StaticClusterMap {
    pub fn new(
        hostname: impl Into<String>,
        port: u16,
        partitions: impl IntoIterator<Item = PartitionId>,
    ) -> Self {
        StaticClusterMap {
            hostname: hostname.into(),
            port,
            mount_path: "/vcr".to_string(),
            partitions: partitions.into_iter().collect(),
        }
    }

    pub fn with_mount_path(mut self, mount_path: impl Into<String>) -> Self {
        self.mount_path = mount_path.into();
        self
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}

impl ClusterMap for StaticClusterMap {
    fn replica_ids(&self, hostname: &str, port: u16) -> Vec<ReplicaId> {
        if hostname != self.hostname || port != self.port {
            return Vec::new();
        }
        self.partitions
            .iter()
            .map(|p| ReplicaId::new(*p, &self.hostname, self.port, &self.mount_path))
            .collect()
    }

    fn partition(&self, id: u64) -> Option<PartitionId> {
        self.partitions.get(&PartitionId(id)).copied()
    }
}
