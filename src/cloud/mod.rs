//! Cloud-Backed Storage
//!
//! Partition storage for VCR nodes, whose data lives in a cloud destination
//! rather than on local disks.
//!
//! ## Architecture
//!
//! ```text
//! membership events ─┐
//!                    ├─► CloudStorageManager ─► PartitionStoreRegistry
//! request handlers ──┘                                 │
//!                                                CloudBlobStore (per partition)
//!                                                      │
//!                                              CloudDestination (shared)
//! ```

pub mod blob_store;
pub mod config;
pub mod destination;
pub mod metrics;
#[cfg(feature = "s3")]
pub mod s3_destination;
pub mod storage_manager;

pub use blob_store::CloudBlobStore;
pub use config::{CloudConfig, ConfigError, DestinationConfig, DestinationType, NodeConfig, S3Config};
pub use destination::{BlobMeta, CloudDestination, InMemoryDestination, ListResult, LocalFsDestination};
pub use metrics::{VcrMetrics, VcrMetricsSnapshot};
#[cfg(feature = "s3")]
pub use s3_destination::S3Destination;
pub use storage_manager::CloudStorageManager;

use crate::store::{InstantiationError, MappingStoreKeyConverterFactory, StoreKeyConverter, StoreKeyConverterFactory};
use std::fmt;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::sync::Arc;

/// Build the destination described by `config`
///
/// Only wires up a client; nothing is sent to the backend until a store
/// starts.
pub fn create_destination(config: &DestinationConfig) -> IoResult<Arc<dyn CloudDestination>> {
    config
        .validate()
        .map_err(|e| IoError::new(ErrorKind::InvalidInput, e.to_string()))?;

    match config.store_type {
        DestinationType::InMemory => Ok(Arc::new(InMemoryDestination::new())),
        DestinationType::LocalFs => {
            let path = config.local_path.clone().ok_or_else(|| {
                IoError::new(ErrorKind::InvalidInput, "local_path is required for localfs")
            })?;
            Ok(Arc::new(LocalFsDestination::new(path)?))
        }
        #[cfg(feature = "s3")]
        DestinationType::S3 => {
            let s3 = config.s3.as_ref().ok_or_else(|| {
                IoError::new(ErrorKind::InvalidInput, "s3 section is required for s3")
            })?;
            Ok(Arc::new(S3Destination::new(s3)?))
        }
        #[cfg(not(feature = "s3"))]
        DestinationType::S3 => Err(IoError::new(
            ErrorKind::Unsupported,
            "S3 support not compiled. Rebuild with --features s3",
        )),
    }
}

/// Error raised while assembling a manager from configuration
#[derive(Debug)]
pub enum BootstrapError {
    Destination(IoError),
    KeyConverter(InstantiationError),
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapError::Destination(e) => write!(f, "Failed to create destination: {}", e),
            BootstrapError::KeyConverter(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for BootstrapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BootstrapError::Destination(e) => Some(e),
            BootstrapError::KeyConverter(e) => Some(e),
        }
    }
}

impl From<IoError> for BootstrapError {
    fn from(e: IoError) -> Self {
        BootstrapError::Destination(e)
    }
}

impl From<InstantiationError> for BootstrapError {
    fn from(e: InstantiationError) -> Self {
        BootstrapError::KeyConverter(e)
    }
}

/// Assemble a storage manager from configuration
///
/// A key converter is built only when a mapping table is configured, and
/// any failure to build it aborts here rather than on first use.
pub fn create_storage_manager(
    config: &CloudConfig,
    metrics: Arc<VcrMetrics>,
) -> Result<CloudStorageManager, BootstrapError> {
    let destination = create_destination(&config.destination)?;

    let converter: Option<Arc<dyn StoreKeyConverter>> = match config.key_converter.mapping_path {
        Some(_) => Some(
            MappingStoreKeyConverterFactory::new(config.key_converter.clone())
                .store_key_converter()?,
        ),
        None => None,
    };

    Ok(CloudStorageManager::new(destination, converter, metrics))
}
