//! Partition Stores
//!
//! A [`Store`] is the live handle for one partition's data on this node. The
//! storage manager owns stores through a [`PartitionStoreRegistry`] and only
//! ever drives their lifecycle; data operations are specific to each store
//! implementation.
//!
//! ## Lifecycle
//!
//! ```text
//! new() ──► not started ──start()──► started
//!               ▲                       │
//!               └──────shutdown()───────┘
//! ```

pub mod key_converter;
pub mod registry;

pub use key_converter::{
    IdentityStoreKeyConverter, IdentityStoreKeyConverterFactory, InstantiationError,
    MappingStoreKeyConverter, MappingStoreKeyConverterFactory, StoreKeyConverter,
    StoreKeyConverterFactory,
};
pub use registry::PartitionStoreRegistry;

use crate::clustermap::PartitionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::io::Error as IoError;
use std::pin::Pin;

/// Identifier of a blob within a partition
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreKey(String);

impl StoreKey {
    pub fn new(key: impl Into<String>) -> Self {
        StoreKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StoreKey {
    fn from(key: &str) -> Self {
        StoreKey(key.to_string())
    }
}

/// Error type for store operations
#[derive(Debug)]
pub enum StoreError {
    /// Data operation attempted on a store that is not started
    NotStarted(PartitionId),
    /// The storage destination failed
    Destination {
        partition: PartitionId,
        source: IoError,
    },
    /// No blob stored under the key
    BlobNotFound(StoreKey),
    /// Stored record failed checksum verification
    Corrupt {
        key: StoreKey,
        expected: u32,
        actual: u32,
    },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotStarted(partition) => write!(f, "Store for {} is not started", partition),
            StoreError::Destination { partition, source } => {
                write!(f, "Destination error for {}: {}", partition, source)
            }
            StoreError::BlobNotFound(key) => write!(f, "Blob not found: {}", key),
            StoreError::Corrupt {
                key,
                expected,
                actual,
            } => write!(
                f,
                "Corrupt blob {}: checksum expected {:#010x}, got {:#010x}",
                key, expected, actual
            ),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Destination { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Lifecycle contract between the storage manager and a partition store
///
/// `start` and `shutdown` may wait on the storage destination and take
/// backend-dependent time. Both must be safe to call repeatedly and
/// concurrently; the manager does not serialize them.
pub trait Store: Send + Sync + 'static {
    /// Partition this store serves
    fn partition_id(&self) -> PartitionId;

    /// Make the store usable for data operations
    fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    /// Stop serving; a no-op on a store that is not started
    fn shutdown(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Whether the store is currently started
    fn is_started(&self) -> bool;
}
