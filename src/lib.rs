pub mod clustermap;
pub mod store;
pub mod cloud;
pub mod server;
pub mod observability;

pub use clustermap::{ClusterMap, PartitionId, ReplicaId, StaticClusterMap};
pub use store::{PartitionStoreRegistry, Store, StoreError, StoreKey};
pub use cloud::{CloudBlobStore, CloudConfig, CloudDestination, CloudStorageManager, VcrMetrics};
pub use server::{ServerErrorCode, StoreManager, StoreManagerError};
