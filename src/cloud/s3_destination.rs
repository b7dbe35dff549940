//! S3 Destination
//!
//! Cloud destination backed by S3 or an S3-compatible service (MinIO,
//! LocalStack), using the `object_store` crate. Retries and credential
//! handling are the client's concern.

use crate::cloud::config::S3Config;
use crate::cloud::destination::{prefix_dir, BlobMeta, CloudDestination, ListResult};
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::pin::Pin;
use std::sync::Arc;

const LIST_PAGE_SIZE: usize = 1000;

/// S3-backed destination
#[derive(Clone)]
pub struct S3Destination {
    client: Arc<dyn ObjectStore>,
    prefix: String,
}

impl S3Destination {
    /// Build a client from configuration
    ///
    /// Credentials come from `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`.
    /// No request is sent until the first operation.
    pub fn new(config: &S3Config) -> IoResult<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_access_key_id(std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default())
            .with_secret_access_key(std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default());

        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let client = builder.build().map_err(|e| {
            IoError::new(
                ErrorKind::InvalidInput,
                format!("Failed to create S3 client: {}", e),
            )
        })?;

        Ok(S3Destination {
            client: Arc::new(client),
            prefix: config.prefix.clone(),
        })
    }

    /// Wrap an existing client
    pub fn from_client(client: Arc<dyn ObjectStore>, prefix: String) -> Self {
        S3Destination { client, prefix }
    }

    fn full_path(&self, key: &str) -> ObjectPath {
        if self.prefix.is_empty() {
            ObjectPath::from(key)
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix, key))
        }
    }

    /// Object path of the directory a list prefix lives under, `None` for
    /// the bucket root
    fn list_scope(&self, prefix: &str) -> Option<ObjectPath> {
        match (self.prefix.as_str(), prefix_dir(prefix)) {
            ("", "") => None,
            (root, "") => Some(ObjectPath::from(root)),
            (_, dir) => Some(self.full_path(dir)),
        }
    }

    fn strip_prefix(&self, path: &ObjectPath) -> String {
        let path_str = path.to_string();
        if self.prefix.is_empty() {
            return path_str;
        }
        let with_slash = format!("{}/", self.prefix);
        path_str
            .strip_prefix(&with_slash)
            .map(str::to_string)
            .unwrap_or(path_str)
    }

    fn map_error(err: object_store::Error) -> IoError {
        match &err {
            object_store::Error::NotFound { .. } => IoError::new(ErrorKind::NotFound, err.to_string()),
            object_store::Error::AlreadyExists { .. } => {
                IoError::new(ErrorKind::AlreadyExists, err.to_string())
            }
            object_store::Error::Precondition { .. } => {
                IoError::new(ErrorKind::InvalidInput, err.to_string())
            }
            _ => IoError::new(ErrorKind::Other, err.to_string()),
        }
    }

    fn meta_from(key: String, meta: &object_store::ObjectMeta) -> BlobMeta {
        BlobMeta {
            key,
            size_bytes: meta.size as u64,
            uploaded_at_ms: meta.last_modified.timestamp_millis().try_into().unwrap_or(0),
            etag: meta.e_tag.clone(),
        }
    }
}

impl std::fmt::Debug for S3Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Destination")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl CloudDestination for S3Destination {
    fn upload<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.full_path(key);
            self.client
                .put(&path, bytes::Bytes::copy_from_slice(data).into())
                .await
                .map_err(Self::map_error)?;
            Ok(())
        })
    }

    fn download<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<u8>>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.full_path(key);
            let result = self.client.get(&path).await.map_err(Self::map_error)?;
            let data = result.bytes().await.map_err(Self::map_error)?;
            Ok(data.to_vec())
        })
    }

    fn exists<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<bool>> + Send + 'a>> {
        Box::pin(async move {
            match self.client.head(&self.full_path(key)).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(Self::map_error(e)),
            }
        })
    }

    fn delete<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            match self.client.delete(&self.full_path(key)).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(e) => Err(Self::map_error(e)),
            }
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        continuation_token: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = IoResult<ListResult>> + Send + 'a>> {
        Box::pin(async move {
            let scope = self.list_scope(prefix);
            // Keys come back in lexical order; a page resumes after the last
            // key of the previous one
            let stream = match continuation_token {
                Some(after) => self
                    .client
                    .list_with_offset(scope.as_ref(), &self.full_path(after)),
                None => self.client.list(scope.as_ref()),
            };
            let mut page: Vec<object_store::ObjectMeta> = stream
                .take(LIST_PAGE_SIZE + 1)
                .try_collect()
                .await
                .map_err(Self::map_error)?;

            let has_more = page.len() > LIST_PAGE_SIZE;
            page.truncate(LIST_PAGE_SIZE);
            let continuation_token = if has_more {
                page.last().map(|meta| self.strip_prefix(&meta.location))
            } else {
                None
            };

            // The scope is a whole directory, so filter to the exact key prefix
            let mut objects: Vec<BlobMeta> = page
                .iter()
                .map(|meta| Self::meta_from(self.strip_prefix(&meta.location), meta))
                .filter(|meta| meta.key.starts_with(prefix))
                .collect();
            objects.sort_by(|a, b| a.key.cmp(&b.key));

            Ok(ListResult {
                objects,
                continuation_token,
            })
        })
    }

    fn head<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<BlobMeta>> + Send + 'a>> {
        Box::pin(async move {
            let meta = self
                .client
                .head(&self.full_path(key))
                .await
                .map_err(Self::map_error)?;
            Ok(Self::meta_from(key.to_string(), &meta))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn destination(prefix: &str) -> S3Destination {
        S3Destination::from_client(Arc::new(InMemory::new()), prefix.to_string())
    }

    #[test]
    fn test_full_path_with_prefix() {
        let dest = destination("vcr");
        assert_eq!(dest.full_path("partition-1/blob").to_string(), "vcr/partition-1/blob");
    }

    #[test]
    fn test_full_path_without_prefix() {
        let dest = destination("");
        assert_eq!(dest.full_path("partition-1/blob").to_string(), "partition-1/blob");
    }

    #[tokio::test]
    async fn test_round_trip_and_list() {
        let dest = destination("vcr");

        dest.upload("partition-1/a", b"1").await.unwrap();
        dest.upload("partition-1/b", b"22").await.unwrap();
        dest.upload("partition-2/a", b"3").await.unwrap();

        assert_eq!(dest.download("partition-1/b").await.unwrap(), b"22");

        let listed = dest.list("partition-1/", None).await.unwrap();
        let keys: Vec<_> = listed.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["partition-1/a", "partition-1/b"]);
        assert!(listed.continuation_token.is_none());
    }

    #[tokio::test]
    async fn test_list_is_scoped_to_prefix_directory() {
        let dest = destination("vcr");
        dest.upload("partition-1/abc", b"1").await.unwrap();
        dest.upload("partition-1/b", b"2").await.unwrap();
        dest.upload("partition-10/abc", b"3").await.unwrap();

        assert_eq!(
            dest.list_scope("partition-1/ab").map(|p| p.to_string()),
            Some("vcr/partition-1".to_string())
        );
        assert_eq!(dest.list_scope("partition").map(|p| p.to_string()), Some("vcr".to_string()));
        assert!(destination("").list_scope("partition").is_none());

        let listed = dest.list("partition-1/ab", None).await.unwrap();
        let keys: Vec<_> = listed.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["partition-1/abc"]);
    }

    #[tokio::test]
    async fn test_list_pages_by_last_key() {
        let dest = destination("vcr");
        for i in 0..LIST_PAGE_SIZE + 5 {
            dest.upload(&format!("partition-1/{:05}", i), b"x").await.unwrap();
        }
        dest.upload("partition-2/00000", b"x").await.unwrap();

        let first = dest.list("partition-1/", None).await.unwrap();
        assert_eq!(first.objects.len(), LIST_PAGE_SIZE);
        let token = first.continuation_token.clone().unwrap();
        assert_eq!(token, format!("partition-1/{:05}", LIST_PAGE_SIZE - 1));

        // A key added behind the cursor does not shift the next page
        dest.upload("partition-1/00000a", b"x").await.unwrap();

        let second = dest.list("partition-1/", Some(&token)).await.unwrap();
        let keys: Vec<_> = second.objects.iter().map(|o| o.key.clone()).collect();
        let expected: Vec<_> = (LIST_PAGE_SIZE..LIST_PAGE_SIZE + 5)
            .map(|i| format!("partition-1/{:05}", i))
            .collect();
        assert_eq!(keys, expected);
        assert!(second.continuation_token.is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dest = destination("vcr");
        dest.upload("partition-1/a", b"1").await.unwrap();

        dest.delete("partition-1/a").await.unwrap();
        dest.delete("partition-1/a").await.unwrap();
        assert!(!dest.exists("partition-1/a").await.unwrap());
    }
}
