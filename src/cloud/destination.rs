//! Cloud Destination Abstraction
//!
//! Where a cloud blob store's bytes actually live. Stores talk to a
//! destination only through the [`CloudDestination`] trait; the storage
//! manager never touches it.
//!
//! Implementations:
//! - `InMemoryDestination`: unit tests and local experiments, with an outage switch
//! - `LocalFsDestination`: a directory on local disk
//! - `S3Destination`: S3-compatible object storage (feature `s3`)

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Metadata for an uploaded object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMeta {
    /// Object key, relative to the destination root
    pub key: String,
    pub size_bytes: u64,
    /// Upload time (Unix ms)
    pub uploaded_at_ms: u64,
    pub etag: Option<String>,
}

/// One page of a list operation
#[derive(Debug, Clone, Default)]
pub struct ListResult {
    /// Objects matching the prefix, sorted by key
    pub objects: Vec<BlobMeta>,
    /// Set when more results exist
    pub continuation_token: Option<String>,
}

/// Storage backend for cloud blob stores
pub trait CloudDestination: Send + Sync + std::fmt::Debug + 'static {
    /// Create or overwrite an object
    fn upload<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>>;

    fn download<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<u8>>> + Send + 'a>>;

    fn exists<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<bool>> + Send + 'a>>;

    /// Delete an object; deleting a missing object succeeds
    fn delete<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>>;

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        continuation_token: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = IoResult<ListResult>> + Send + 'a>>;

    /// Object metadata without downloading content
    fn head<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<BlobMeta>> + Send + 'a>>;
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn not_found(key: &str) -> IoError {
    IoError::new(ErrorKind::NotFound, format!("Key not found: {}", key))
}

/// Directory part of a list prefix: everything before its last `/`
///
/// Listing can be narrowed to this directory since every matching key lives
/// under it.
pub(crate) fn prefix_dir(prefix: &str) -> &str {
    prefix.rfind('/').map_or("", |i| &prefix[..i])
}

static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

// ============================================================================
// InMemoryDestination
// ============================================================================

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Vec<u8>,
    uploaded_at_ms: u64,
}

/// In-memory destination
///
/// Clones share the same contents. [`set_available`](Self::set_available)
/// simulates a backend outage: while unavailable every call fails with
/// `ConnectionRefused`.
#[derive(Debug, Clone)]
pub struct InMemoryDestination {
    blobs: Arc<RwLock<BTreeMap<String, StoredBlob>>>,
    available: Arc<AtomicBool>,
}

impl InMemoryDestination {
    pub fn new() -> Self {
        InMemoryDestination {
            blobs: Arc::new(RwLock::new(BTreeMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Overwrite raw bytes, bypassing availability (for corruption tests)
    pub fn overwrite_raw(&self, key: &str, data: Vec<u8>) {
        self.blobs.write().insert(
            key.to_string(),
            StoredBlob {
                data,
                uploaded_at_ms: now_ms(),
            },
        );
    }

    fn check_available(&self) -> IoResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(IoError::new(
                ErrorKind::ConnectionRefused,
                "destination unavailable",
            ))
        }
    }

    fn meta(key: &str, blob: &StoredBlob) -> BlobMeta {
        BlobMeta {
            key: key.to_string(),
            size_bytes: blob.data.len() as u64,
            uploaded_at_ms: blob.uploaded_at_ms,
            etag: Some(format!("{:08x}", crc32fast::hash(&blob.data))),
        }
    }
}

impl Default for InMemoryDestination {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudDestination for InMemoryDestination {
    fn upload<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.check_available()?;
            self.overwrite_raw(key, data.to_vec());
            Ok(())
        })
    }

    fn download<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<u8>>> + Send + 'a>> {
        Box::pin(async move {
            self.check_available()?;
            self.blobs
                .read()
                .get(key)
                .map(|blob| blob.data.clone())
                .ok_or_else(|| not_found(key))
        })
    }

    fn exists<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<bool>> + Send + 'a>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.blobs.read().contains_key(key))
        })
    }

    fn delete<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.check_available()?;
            self.blobs.write().remove(key);
            Ok(())
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        _continuation_token: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = IoResult<ListResult>> + Send + 'a>> {
        Box::pin(async move {
            self.check_available()?;
            let objects = self
                .blobs
                .read()
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, blob)| Self::meta(k, blob))
                .collect();
            Ok(ListResult {
                objects,
                continuation_token: None,
            })
        })
    }

    fn head<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<BlobMeta>> + Send + 'a>> {
        Box::pin(async move {
            self.check_available()?;
            self.blobs
                .read()
                .get(key)
                .map(|blob| Self::meta(key, blob))
                .ok_or_else(|| not_found(key))
        })
    }
}

// ============================================================================
// LocalFsDestination
// ============================================================================

/// Destination rooted at a local directory
#[derive(Debug, Clone)]
pub struct LocalFsDestination {
    base_path: PathBuf,
}

impl LocalFsDestination {
    /// Create a destination rooted at `base_path`, creating the directory
    pub fn new(base_path: PathBuf) -> IoResult<Self> {
        std::fs::create_dir_all(&base_path)?;
        Ok(LocalFsDestination { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve `key` under the base path
    ///
    /// Keys are `/`-separated non-empty segments. Segments starting with `.`
    /// are reserved for in-flight uploads, which also rules out `.` and `..`.
    fn full_path(&self, key: &str) -> IoResult<PathBuf> {
        let well_formed = !key.is_empty()
            && key
                .split('/')
                .all(|segment| !segment.is_empty() && !segment.starts_with('.'));
        let relative = Path::new(key);
        let normal = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !well_formed || !normal {
            return Err(IoError::new(
                ErrorKind::InvalidInput,
                format!("Invalid object key: {:?}", key),
            ));
        }
        Ok(self.base_path.join(relative))
    }

    /// Sibling path an upload writes to before renaming into place
    fn staging_path(path: &Path) -> PathBuf {
        let seq = UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{}.{}.{}.tmp", name, std::process::id(), seq))
    }

    fn meta_from(key: String, metadata: &std::fs::Metadata) -> BlobMeta {
        BlobMeta {
            key,
            size_bytes: metadata.len(),
            uploaded_at_ms: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            etag: None,
        }
    }

    fn walk(dir: &Path, base: &Path, prefix: &str, objects: &mut Vec<BlobMeta>) -> IoResult<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                Self::walk(&path, base, prefix, objects)?;
            } else if file_type.is_file() {
                let Ok(relative) = path.strip_prefix(base) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    objects.push(Self::meta_from(key, &entry.metadata()?));
                }
            }
        }
        Ok(())
    }
}

impl CloudDestination for LocalFsDestination {
    fn upload<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.full_path(key)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            // Write then rename so readers never observe a partial object
            let tmp = Self::staging_path(&path);
            let written = match tokio::fs::write(&tmp, data).await {
                Ok(()) => tokio::fs::rename(&tmp, &path).await,
                Err(e) => Err(e),
            };
            if written.is_err() {
                let _ = tokio::fs::remove_file(&tmp).await;
            }
            written
        })
    }

    fn download<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<u8>>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.full_path(key)?;
            tokio::fs::read(&path).await
        })
    }

    fn exists<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<bool>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.full_path(key)?;
            tokio::fs::try_exists(&path).await
        })
    }

    fn delete<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.full_path(key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            }
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        _continuation_token: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = IoResult<ListResult>> + Send + 'a>> {
        Box::pin(async move {
            let base = self.base_path.clone();
            let start = match prefix_dir(prefix) {
                "" => base.clone(),
                dir => self.full_path(dir)?,
            };
            let prefix = prefix.to_string();
            let objects = tokio::task::spawn_blocking(move || {
                let mut objects = Vec::new();
                if start.is_dir() {
                    Self::walk(&start, &base, &prefix, &mut objects)?;
                }
                objects.sort_by(|a, b| a.key.cmp(&b.key));
                Ok::<_, IoError>(objects)
            })
            .await
            .map_err(|e| IoError::new(ErrorKind::Other, e))??;

            Ok(ListResult {
                objects,
                continuation_token: None,
            })
        })
    }

    fn head<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<BlobMeta>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.full_path(key)?;
            let metadata = tokio::fs::metadata(&path).await?;
            Ok(Self::meta_from(key.to_string(), &metadata))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_upload_download() {
        let dest = InMemoryDestination::new();

        dest.upload("p1/key1", b"hello world").await.unwrap();
        let data = dest.download("p1/key1").await.unwrap();

        assert_eq!(data, b"hello world");
        assert_eq!(dest.len(), 1);
    }

    #[tokio::test]
    async fn test_inmemory_list_is_prefix_scoped() {
        let dest = InMemoryDestination::new();

        dest.upload("partition-1/a", b"1").await.unwrap();
        dest.upload("partition-1/b", b"2").await.unwrap();
        dest.upload("partition-10/a", b"3").await.unwrap();
        dest.upload("partition-2/a", b"4").await.unwrap();

        let result = dest.list("partition-1/", None).await.unwrap();
        let keys: Vec<_> = result.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["partition-1/a", "partition-1/b"]);
    }

    #[tokio::test]
    async fn test_inmemory_delete_and_head() {
        let dest = InMemoryDestination::new();

        dest.upload("k", b"data").await.unwrap();
        let meta = dest.head("k").await.unwrap();
        assert_eq!(meta.size_bytes, 4);

        dest.delete("k").await.unwrap();
        dest.delete("k").await.unwrap();
        assert!(!dest.exists("k").await.unwrap());
        assert_eq!(
            dest.head("k").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_inmemory_outage() {
        let dest = InMemoryDestination::new();
        dest.upload("k", b"data").await.unwrap();

        dest.set_available(false);
        let err = dest.download("k").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
        assert!(dest.list("", None).await.is_err());

        dest.set_available(true);
        assert_eq!(dest.download("k").await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_clones_share_contents() {
        let dest = InMemoryDestination::new();
        let other = dest.clone();

        dest.upload("k", b"v").await.unwrap();
        assert!(other.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_localfs_upload_download() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalFsDestination::new(dir.path().to_path_buf()).unwrap();

        dest.upload("partition-1/blob", b"hello").await.unwrap();
        assert_eq!(dest.download("partition-1/blob").await.unwrap(), b"hello");
        assert!(dest.exists("partition-1/blob").await.unwrap());
        assert_eq!(dest.head("partition-1/blob").await.unwrap().size_bytes, 5);
    }

    #[tokio::test]
    async fn test_localfs_list() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalFsDestination::new(dir.path().to_path_buf()).unwrap();

        dest.upload("partition-1/a", b"1").await.unwrap();
        dest.upload("partition-1/b", b"2").await.unwrap();
        dest.upload("partition-2/a", b"3").await.unwrap();

        let result = dest.list("partition-1/", None).await.unwrap();
        let keys: Vec<_> = result.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["partition-1/a", "partition-1/b"]);
    }

    #[tokio::test]
    async fn test_localfs_delete_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalFsDestination::new(dir.path().to_path_buf()).unwrap();

        dest.delete("partition-1/nothing").await.unwrap();
    }

    #[tokio::test]
    async fn test_localfs_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalFsDestination::new(dir.path().to_path_buf()).unwrap();

        for key in ["../outside", "/etc/passwd", "a/../../b", ""] {
            let err = dest.upload(key, b"x").await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput, "key {:?}", key);
        }
    }

    #[tokio::test]
    async fn test_localfs_rejects_aliasing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalFsDestination::new(dir.path().to_path_buf()).unwrap();
        dest.upload("p/k", b"original").await.unwrap();

        for key in ["./p/k", "p/./k", "p//k", "p/k/", "p/.k.1.2.tmp"] {
            let err = dest.upload(key, b"alias").await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput, "key {:?}", key);
        }
        assert_eq!(dest.download("p/k").await.unwrap(), b"original");
    }

    #[tokio::test]
    async fn test_localfs_upload_leaves_sibling_keys_alone() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalFsDestination::new(dir.path().to_path_buf()).unwrap();

        dest.upload("partition-1/x.upload", b"first").await.unwrap();
        dest.upload("partition-1/x", b"second").await.unwrap();

        assert_eq!(dest.download("partition-1/x.upload").await.unwrap(), b"first");
        assert_eq!(dest.download("partition-1/x").await.unwrap(), b"second");

        let listed = dest.list("partition-1/", None).await.unwrap();
        let keys: Vec<_> = listed.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["partition-1/x", "partition-1/x.upload"]);
    }

    #[tokio::test]
    async fn test_localfs_concurrent_uploads_same_stem() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalFsDestination::new(dir.path().to_path_buf()).unwrap();

        for _ in 0..20 {
            let (a, b) = tokio::join!(
                dest.upload("partition-1/x.a", b"payload-a"),
                dest.upload("partition-1/x.b", b"payload-b"),
            );
            a.unwrap();
            b.unwrap();

            assert_eq!(dest.download("partition-1/x.a").await.unwrap(), b"payload-a");
            assert_eq!(dest.download("partition-1/x.b").await.unwrap(), b"payload-b");
        }
    }

    #[tokio::test]
    async fn test_localfs_list_skips_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalFsDestination::new(dir.path().to_path_buf()).unwrap();
        dest.upload("partition-1/a", b"1").await.unwrap();

        // Left behind by an interrupted upload
        std::fs::write(dir.path().join("partition-1/.a.77.0.tmp"), b"partial").unwrap();

        let listed = dest.list("partition-1/", None).await.unwrap();
        let keys: Vec<_> = listed.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["partition-1/a"]);
    }

    #[tokio::test]
    async fn test_localfs_list_partial_segment_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalFsDestination::new(dir.path().to_path_buf()).unwrap();

        dest.upload("partition-1/abc", b"1").await.unwrap();
        dest.upload("partition-1/b", b"2").await.unwrap();
        dest.upload("partition-10/abc", b"3").await.unwrap();

        let listed = dest.list("partition-1/ab", None).await.unwrap();
        let keys: Vec<_> = listed.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["partition-1/abc"]);

        let listed = dest.list("partition-1", None).await.unwrap();
        assert_eq!(listed.objects.len(), 3);

        assert!(dest.list("partition-9/", None).await.unwrap().objects.is_empty());
    }

    #[test]
    fn test_prefix_dir() {
        assert_eq!(prefix_dir("partition-1/"), "partition-1");
        assert_eq!(prefix_dir("partition-1/ab"), "partition-1");
        assert_eq!(prefix_dir("a/b/c"), "a/b");
        assert_eq!(prefix_dir("partition-1"), "");
        assert_eq!(prefix_dir(""), "");
    }
}
