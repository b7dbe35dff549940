//! VCR node metrics
//!
//! Lock-free counters shared by the storage manager and every cloud blob
//! store it creates.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct VcrMetrics {
    blob_stores_created: AtomicU64,
    blob_store_starts: AtomicU64,
    blob_store_start_failures: AtomicU64,
    blob_store_shutdowns: AtomicU64,
    blob_uploads: AtomicU64,
    blob_downloads: AtomicU64,
    blob_deletes: AtomicU64,
    blob_corruptions: AtomicU64,
    keys_converted: AtomicU64,
}

/// Point-in-time copy of [`VcrMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VcrMetricsSnapshot {
    pub blob_stores_created: u64,
    pub blob_store_starts: u64,
    pub blob_store_start_failures: u64,
    pub blob_store_shutdowns: u64,
    pub blob_uploads: u64,
    pub blob_downloads: u64,
    pub blob_deletes: u64,
    pub blob_corruptions: u64,
    pub keys_converted: u64,
}

impl VcrMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_store_created(&self) {
        self.blob_stores_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_started(&self) {
        self.blob_store_starts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_start_failure(&self) {
        self.blob_store_start_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_shutdown(&self) {
        self.blob_store_shutdowns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upload(&self) {
        self.blob_uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download(&self) {
        self.blob_downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.blob_deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corruption(&self) {
        self.blob_corruptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Count keys whose converted form differs from the original
    pub fn record_keys_converted(&self, count: u64) {
        if count > 0 {
            self.keys_converted.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> VcrMetricsSnapshot {
        VcrMetricsSnapshot {
            blob_stores_created: self.blob_stores_created.load(Ordering::Relaxed),
            blob_store_starts: self.blob_store_starts.load(Ordering::Relaxed),
            blob_store_start_failures: self.blob_store_start_failures.load(Ordering::Relaxed),
            blob_store_shutdowns: self.blob_store_shutdowns.load(Ordering::Relaxed),
            blob_uploads: self.blob_uploads.load(Ordering::Relaxed),
            blob_downloads: self.blob_downloads.load(Ordering::Relaxed),
            blob_deletes: self.blob_deletes.load(Ordering::Relaxed),
            blob_corruptions: self.blob_corruptions.load(Ordering::Relaxed),
            keys_converted: self.keys_converted.load(Ordering::Relaxed),
        }
    }
}
