//! Cloud Blob Store
//!
//! [`Store`] implementation whose data lives in a [`CloudDestination`].
//! Construction only wires references together. The first contact with the
//! destination happens in `start`, which lists the partition's objects to
//! confirm the backend is reachable.
//!
//! ## Record Format
//!
//! ```text
//! <partition>/<store-key>  →  [crc32: u32 BE][payload]
//! ```
//!
//! Every keyed operation first resolves the key through the store's
//! converter, so superseded keys reach their canonical blob.

use crate::cloud::destination::CloudDestination;
use crate::cloud::metrics::VcrMetrics;
use crate::clustermap::PartitionId;
use crate::store::{Store, StoreError, StoreKey, StoreKeyConverter};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CHECKSUM_LEN: usize = 4;

pub struct CloudBlobStore {
    partition_id: PartitionId,
    destination: Arc<dyn CloudDestination>,
    converter: Option<Arc<dyn StoreKeyConverter>>,
    metrics: Arc<VcrMetrics>,
    started: AtomicBool,
}

impl CloudBlobStore {
    pub fn new(
        partition_id: PartitionId,
        destination: Arc<dyn CloudDestination>,
        converter: Option<Arc<dyn StoreKeyConverter>>,
        metrics: Arc<VcrMetrics>,
    ) -> Self {
        metrics.record_store_created();
        CloudBlobStore {
            partition_id,
            destination,
            converter,
            metrics,
            started: AtomicBool::new(false),
        }
    }

    /// Upload `data` under `key`, replacing any existing blob
    pub async fn put_blob(&self, key: &StoreKey, data: &[u8]) -> Result<(), StoreError> {
        self.check_started()?;
        let object_key = self.object_key(&self.canonical(key));

        let mut record = Vec::with_capacity(CHECKSUM_LEN + data.len());
        record.extend_from_slice(&crc32fast::hash(data).to_be_bytes());
        record.extend_from_slice(data);

        self.destination
            .upload(&object_key, &record)
            .await
            .map_err(|e| self.destination_error(e))?;
        self.metrics.record_upload();
        debug!(partition = %self.partition_id, key = %key, bytes = data.len(), "Uploaded blob");
        Ok(())
    }

    /// Download the blob stored under `key`, verifying its checksum
    pub async fn get_blob(&self, key: &StoreKey) -> Result<Bytes, StoreError> {
        self.check_started()?;
        let canonical = self.canonical(key);
        let object_key = self.object_key(&canonical);

        let raw = match self.destination.download(&object_key).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::BlobNotFound(key.clone()))
            }
            Err(e) => return Err(self.destination_error(e)),
        };
        self.metrics.record_download();

        match Self::decode_record(&raw) {
            Ok(payload) => Ok(Bytes::copy_from_slice(payload)),
            Err((expected, actual)) => {
                self.metrics.record_corruption();
                warn!(
                    partition = %self.partition_id,
                    key = %canonical,
                    expected,
                    actual,
                    "Blob failed checksum verification"
                );
                Err(StoreError::Corrupt {
                    key: canonical,
                    expected,
                    actual,
                })
            }
        }
    }

    /// Delete the blob stored under `key`; deleting a missing blob succeeds
    pub async fn delete_blob(&self, key: &StoreKey) -> Result<(), StoreError> {
        self.check_started()?;
        let object_key = self.object_key(&self.canonical(key));
        self.destination
            .delete(&object_key)
            .await
            .map_err(|e| self.destination_error(e))?;
        self.metrics.record_delete();
        Ok(())
    }

    /// Keys from `keys` that have no blob in this partition
    ///
    /// Converts the whole batch and lists the partition once, instead of
    /// probing the destination per key.
    pub async fn find_missing_keys(&self, keys: &[StoreKey]) -> Result<Vec<StoreKey>, StoreError> {
        self.check_started()?;
        let converted = self.canonical_many(keys);

        let present: HashSet<String> = self
            .list_object_keys()
            .await?
            .into_iter()
            .collect();

        Ok(keys
            .iter()
            .filter(|key| {
                let canonical = converted.get(*key).unwrap_or(*key);
                !present.contains(&self.object_key(canonical))
            })
            .cloned()
            .collect())
    }

    /// Number of blobs stored for this partition
    pub async fn blob_count(&self) -> Result<usize, StoreError> {
        self.check_started()?;
        Ok(self.list_object_keys().await?.len())
    }

    fn check_started(&self) -> Result<(), StoreError> {
        if self.started.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::NotStarted(self.partition_id))
        }
    }

    fn prefix(&self) -> String {
        format!("{}/", self.partition_id)
    }

    fn object_key(&self, key: &StoreKey) -> String {
        format!("{}/{}", self.partition_id, key)
    }

    fn canonical(&self, key: &StoreKey) -> StoreKey {
        match &self.converter {
            Some(converter) => {
                let canonical = converter.convert(key);
                if &canonical != key {
                    self.metrics.record_keys_converted(1);
                }
                canonical
            }
            None => key.clone(),
        }
    }

    fn canonical_many(&self, keys: &[StoreKey]) -> HashMap<StoreKey, StoreKey> {
        match &self.converter {
            Some(converter) => {
                let converted = converter.convert_many(keys);
                let changed = converted.iter().filter(|(from, to)| from != to).count();
                self.metrics.record_keys_converted(changed as u64);
                converted
            }
            None => keys.iter().map(|k| (k.clone(), k.clone())).collect(),
        }
    }

    /// Every object key under this partition's prefix, following pagination
    async fn list_object_keys(&self) -> Result<Vec<String>, StoreError> {
        let prefix = self.prefix();
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .destination
                .list(&prefix, token.as_deref())
                .await
                .map_err(|e| self.destination_error(e))?;
            keys.extend(page.objects.into_iter().map(|meta| meta.key));
            match page.continuation_token {
                Some(next) => token = Some(next),
                None => return Ok(keys),
            }
        }
    }

    fn destination_error(&self, source: IoError) -> StoreError {
        StoreError::Destination {
            partition: self.partition_id,
            source,
        }
    }

    /// Split a record into its payload, or return (expected, actual) checksums
    fn decode_record(raw: &[u8]) -> Result<&[u8], (u32, u32)> {
        if raw.len() < CHECKSUM_LEN {
            return Err((0, crc32fast::hash(raw)));
        }
        let (header, payload) = raw.split_at(CHECKSUM_LEN);
        let expected = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let actual = crc32fast::hash(payload);
        if expected == actual {
            Ok(payload)
        } else {
            Err((expected, actual))
        }
    }
}

impl fmt::Debug for CloudBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudBlobStore")
            .field("partition_id", &self.partition_id)
            .field("destination", &self.destination)
            .field("started", &self.is_started())
            .finish()
    }
}

impl fmt::Display for CloudBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CloudBlobStore[{}]", self.partition_id)
    }
}

impl Store for CloudBlobStore {
    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            if self.is_started() {
                return Ok(());
            }

            let blobs = self.list_object_keys().await?.len();

            // A concurrent start may have won while we were probing
            if self
                .started
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.metrics.record_store_started();
                info!(partition = %self.partition_id, blobs, "Started cloud blob store");
            }
            Ok(())
        })
    }

    fn shutdown(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if self.started.swap(false, Ordering::AcqRel) {
                self.metrics.record_store_shutdown();
                info!(partition = %self.partition_id, "Shut down cloud blob store");
            }
        })
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::destination::InMemoryDestination;
    use crate::store::MappingStoreKeyConverter;

    fn store_with(destination: &InMemoryDestination) -> (CloudBlobStore, Arc<VcrMetrics>) {
        let metrics = Arc::new(VcrMetrics::new());
        let store = CloudBlobStore::new(
            PartitionId(1),
            Arc::new(destination.clone()),
            None,
            metrics.clone(),
        );
        (store, metrics)
    }

    #[tokio::test]
    async fn test_new_store_is_not_started() {
        let destination = InMemoryDestination::new();
        let (store, metrics) = store_with(&destination);

        assert!(!store.is_started());
        assert_eq!(metrics.snapshot().blob_stores_created, 1);
        assert!(matches!(
            store.get_blob(&"k".into()).await,
            Err(StoreError::NotStarted(PartitionId(1)))
        ));
    }

    #[tokio::test]
    async fn test_start_and_shutdown_are_idempotent() {
        let destination = InMemoryDestination::new();
        let (store, metrics) = store_with(&destination);

        store.start().await.unwrap();
        store.start().await.unwrap();
        assert!(store.is_started());

        store.shutdown().await;
        store.shutdown().await;
        assert!(!store.is_started());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.blob_store_starts, 1);
        assert_eq!(snapshot.blob_store_shutdowns, 1);
    }

    #[tokio::test]
    async fn test_start_fails_when_destination_unreachable() {
        let destination = InMemoryDestination::new();
        destination.set_available(false);
        let (store, _) = store_with(&destination);

        let err = store.start().await.unwrap_err();
        assert!(matches!(err, StoreError::Destination { .. }));
        assert!(!store.is_started());

        destination.set_available(true);
        store.start().await.unwrap();
        assert!(store.is_started());
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let destination = InMemoryDestination::new();
        let (store, metrics) = store_with(&destination);
        store.start().await.unwrap();

        let key = StoreKey::from("blob-1");
        store.put_blob(&key, b"payload").await.unwrap();
        assert!(destination.exists("partition-1/blob-1").await.unwrap());

        assert_eq!(store.get_blob(&key).await.unwrap(), Bytes::from_static(b"payload"));
        assert_eq!(store.blob_count().await.unwrap(), 1);

        store.delete_blob(&key).await.unwrap();
        assert!(matches!(
            store.get_blob(&key).await,
            Err(StoreError::BlobNotFound(_))
        ));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.blob_uploads, 1);
        assert_eq!(snapshot.blob_downloads, 1);
        assert_eq!(snapshot.blob_deletes, 1);
    }

    #[tokio::test]
    async fn test_corrupt_record_detected() {
        let destination = InMemoryDestination::new();
        let (store, metrics) = store_with(&destination);
        store.start().await.unwrap();

        let key = StoreKey::from("blob-1");
        store.put_blob(&key, b"payload").await.unwrap();
        destination.overwrite_raw("partition-1/blob-1", b"\0\0\0\0tampered".to_vec());

        let err = store.get_blob(&key).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { expected: 0, .. }));

        destination.overwrite_raw("partition-1/blob-1", vec![1, 2]);
        assert!(matches!(
            store.get_blob(&key).await,
            Err(StoreError::Corrupt { .. })
        ));
        assert_eq!(metrics.snapshot().blob_corruptions, 2);
    }

    #[tokio::test]
    async fn test_converter_resolves_superseded_keys() {
        let destination = InMemoryDestination::new();
        let metrics = Arc::new(VcrMetrics::new());
        let table: HashMap<StoreKey, StoreKey> =
            [(StoreKey::from("old"), StoreKey::from("new"))].into_iter().collect();
        let converter = Arc::new(MappingStoreKeyConverter::from_table(table).unwrap());
        let store = CloudBlobStore::new(
            PartitionId(1),
            Arc::new(destination.clone()),
            Some(converter),
            metrics.clone(),
        );
        store.start().await.unwrap();

        store.put_blob(&"new".into(), b"data").await.unwrap();
        assert_eq!(store.get_blob(&"old".into()).await.unwrap(), Bytes::from_static(b"data"));

        let missing = store
            .find_missing_keys(&["old".into(), "new".into(), "absent".into()])
            .await
            .unwrap();
        assert_eq!(missing, vec![StoreKey::from("absent")]);
        assert_eq!(metrics.snapshot().keys_converted, 2);
    }

    #[tokio::test]
    async fn test_partitions_do_not_share_blobs() {
        let destination = InMemoryDestination::new();
        let metrics = Arc::new(VcrMetrics::new());
        let first = CloudBlobStore::new(PartitionId(1), Arc::new(destination.clone()), None, metrics.clone());
        let second = CloudBlobStore::new(PartitionId(2), Arc::new(destination.clone()), None, metrics);
        first.start().await.unwrap();
        second.start().await.unwrap();

        first.put_blob(&"k".into(), b"one").await.unwrap();

        assert!(matches!(
            second.get_blob(&"k".into()).await,
            Err(StoreError::BlobNotFound(_))
        ));
        assert_eq!(second.find_missing_keys(&["k".into()]).await.unwrap().len(), 1);
    }
}
