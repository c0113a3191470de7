//! Object storage abstraction.
//!
//! Wraps `object_store` backends behind one provider type so the engine can
//! list, read, and bulk-delete blobs without caring whether they live in S3,
//! Azure Blob Storage, a local directory, or memory. The queue engine only
//! ever needs read access plus the optional after-processing delete.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use snafu::prelude::*;
use tracing::debug;

use crate::error::{InvalidUrlSnafu, IoSnafu, ObjectStoreSnafu, StorageError};

/// A reference-counted storage provider.
pub type ObjectStorageRef = Arc<ObjectStorageProvider>;

/// The closed set of blob-store flavors the queue engine supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    S3,
    Azure,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::S3 => "s3",
            StorageType::Azure => "azure",
        }
    }
}

/// Listing entry: the object key plus the metadata exposed as virtual columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Key relative to the provider root.
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last-modified timestamp, unix milliseconds.
    pub last_modified_ms: i64,
}

/// Storage provider that abstracts over the supported backends.
pub struct ObjectStorageProvider {
    store: Arc<dyn ObjectStore>,
    storage_type: StorageType,
    url: String,
}

impl std::fmt::Debug for ObjectStorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectStorageProvider<{}>", self.url)
    }
}

impl ObjectStorageProvider {
    /// Create a provider for the given URL.
    ///
    /// Supported schemes: `s3://bucket`, `az://container`,
    /// `file:///absolute/dir`, and `memory://` for tests.
    pub fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        if let Some(bucket) = url.strip_prefix("s3://") {
            let mut builder = AmazonS3Builder::from_env().with_bucket_name(trim_key(bucket));
            for (key, value) in &options {
                builder = builder.with_config(
                    key.parse()
                        .map_err(|_| InvalidUrlSnafu { url: url.to_string() }.build())?,
                    value,
                );
            }
            let store = builder.build().context(ObjectStoreSnafu)?;
            Ok(Self::new(Arc::new(store), StorageType::S3, url))
        } else if let Some(container) = url.strip_prefix("az://") {
            let mut builder =
                MicrosoftAzureBuilder::from_env().with_container_name(trim_key(container));
            for (key, value) in &options {
                builder = builder.with_config(
                    key.parse()
                        .map_err(|_| InvalidUrlSnafu { url: url.to_string() }.build())?,
                    value,
                );
            }
            let store = builder.build().context(ObjectStoreSnafu)?;
            Ok(Self::new(Arc::new(store), StorageType::Azure, url))
        } else if let Some(dir) = url.strip_prefix("file://") {
            let store = LocalFileSystem::new_with_prefix(dir).context(ObjectStoreSnafu)?;
            Ok(Self::new(Arc::new(store), StorageType::S3, url))
        } else if url.starts_with("memory://") {
            Ok(Self::memory(StorageType::S3))
        } else {
            InvalidUrlSnafu { url: url.to_string() }.fail()
        }
    }

    /// In-memory provider for tests and embedded use.
    pub fn memory(storage_type: StorageType) -> Self {
        Self::new(Arc::new(InMemory::new()), storage_type, "memory://")
    }

    /// Local-directory provider (used by tests that want real files).
    pub fn local(dir: &std::path::Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir).context(IoSnafu)?;
        let store = LocalFileSystem::new_with_prefix(dir).context(ObjectStoreSnafu)?;
        Ok(Self::new(
            Arc::new(store),
            StorageType::S3,
            &format!("file://{}", dir.display()),
        ))
    }

    fn new(store: Arc<dyn ObjectStore>, storage_type: StorageType, url: &str) -> Self {
        Self {
            store,
            storage_type,
            url: url.to_string(),
        }
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// List all objects under the optional key prefix, sorted by key.
    ///
    /// The underlying store pages its listing protocol internally; callers
    /// re-page the result in whatever batch size they need.
    pub async fn list_all(&self, prefix: Option<&str>) -> Result<Vec<ObjectInfo>, StorageError> {
        let prefix_path = prefix
            .filter(|p| !p.is_empty())
            .map(|p| Path::from(p.trim_matches('/')));
        let mut stream = self.store.list(prefix_path.as_ref());

        let mut objects = Vec::new();
        while let Some(entry) = stream.next().await {
            let meta = entry.context(ObjectStoreSnafu)?;
            objects.push(ObjectInfo {
                path: meta.location.to_string(),
                size: meta.size as u64,
                last_modified_ms: meta.last_modified.timestamp_millis(),
            });
        }
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }

    /// Get the contents of an object.
    pub async fn get(&self, path: &str) -> Result<Bytes, StorageError> {
        let result = self
            .store
            .get(&Path::from(path))
            .await
            .context(ObjectStoreSnafu)?;
        result.bytes().await.context(ObjectStoreSnafu)
    }

    /// Put bytes to a path.
    pub async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.store
            .put(&Path::from(path), PutPayload::from(Bytes::from(bytes)))
            .await
            .context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Delete the given objects, ignoring ones that are already gone.
    pub async fn delete_objects_if_exist(&self, paths: &[String]) -> Result<(), StorageError> {
        for path in paths {
            match self.store.delete(&Path::from(path.as_str())).await {
                Ok(()) => {}
                Err(object_store::Error::NotFound { .. }) => {
                    debug!(path = %path, "Object already removed");
                }
                Err(source) => return Err(StorageError::ObjectStore { source }),
            }
        }
        Ok(())
    }
}

fn trim_key(bucket_and_key: &str) -> &str {
    bucket_and_key
        .split_once('/')
        .map(|(bucket, _)| bucket)
        .unwrap_or(bucket_and_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_put_list_get_delete() {
        let storage = ObjectStorageProvider::memory(StorageType::S3);

        storage.put("data/b.ndjson", b"{}\n".to_vec()).await.unwrap();
        storage.put("data/a.ndjson", b"{}\n".to_vec()).await.unwrap();
        storage.put("other/c.ndjson", b"{}\n".to_vec()).await.unwrap();

        let listed = storage.list_all(Some("data")).await.unwrap();
        assert_eq!(listed.len(), 2);
        // Sorted by key regardless of insertion order.
        assert_eq!(listed[0].path, "data/a.ndjson");
        assert_eq!(listed[1].path, "data/b.ndjson");
        assert!(listed.iter().all(|o| o.size == 3));

        let bytes = storage.get("data/a.ndjson").await.unwrap();
        assert_eq!(&bytes[..], b"{}\n");

        storage
            .delete_objects_if_exist(&["data/a.ndjson".to_string(), "data/missing".to_string()])
            .await
            .unwrap();
        let listed = storage.list_all(Some("data")).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_scheme_rejected() {
        let err =
            ObjectStorageProvider::for_url_with_options("gopher://x", HashMap::new()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_local_provider_roundtrip() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let storage = ObjectStorageProvider::local(temp_dir.path()).unwrap();

        storage
            .put("data/a.ndjson", b"{\"id\":1}\n".to_vec())
            .await
            .unwrap();

        let listed = storage.list_all(Some("data")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "data/a.ndjson");
        assert!(listed[0].last_modified_ms > 0);

        let bytes = storage.get("data/a.ndjson").await.unwrap();
        assert_eq!(&bytes[..], b"{\"id\":1}\n");
    }
}
