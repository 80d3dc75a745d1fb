//! Blob storage backends for durable history persistence.
//!
//! Backends implement the [`BlobStore`] trait. The history log persists as
//! one index blob per workflow (the ordered list of record keys) plus one
//! JSON document per record, so any store that can read and write keyed
//! JSON blobs works: filesystem, SQL, S3, DynamoDB. The in-memory store is
//! for tests; the filesystem store (feature `fs-backend`) is the reference
//! durable implementation.

#[cfg(feature = "fs-backend")]
mod fs;

#[cfg(feature = "fs-backend")]
pub use fs::FileBlobStore;

use async_trait::async_trait;
use serde_json::Value;

/// Keyed JSON blob storage.
///
/// The engine never retries failed operations; durability and retry policy
/// belong to the backend.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write (or overwrite) a blob.
    async fn write_blob(&self, key: &str, document: &Value) -> anyhow::Result<()>;

    /// Read a blob; errors if the key does not exist.
    async fn read_blob(&self, key: &str) -> anyhow::Result<Value>;

    /// Check whether a blob exists.
    async fn has_blob(&self, key: &str) -> anyhow::Result<bool>;

    /// Delete a blob. Deleting an absent key is not an error.
    async fn delete_blob(&self, key: &str) -> anyhow::Result<()>;
}

/// In-memory blob store for testing.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: parking_lot::RwLock<std::collections::HashMap<String, Value>>,
}

impl InMemoryBlobStore {
    /// Create an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// True when no blobs are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn write_blob(&self, key: &str, document: &Value) -> anyhow::Result<()> {
        self.blobs
            .write()
            .insert(key.to_string(), document.clone());
        Ok(())
    }

    async fn read_blob(&self, key: &str) -> anyhow::Result<Value> {
        self.blobs
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no blob for key {key}"))
    }

    async fn has_blob(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.blobs.read().contains_key(key))
    }

    async fn delete_blob(&self, key: &str) -> anyhow::Result<()> {
        self.blobs.write().remove(key);
        Ok(())
    }
}

#[async_trait]
impl<T: BlobStore + ?Sized> BlobStore for Box<T> {
    async fn write_blob(&self, key: &str, document: &Value) -> anyhow::Result<()> {
        (**self).write_blob(key, document).await
    }

    async fn read_blob(&self, key: &str) -> anyhow::Result<Value> {
        (**self).read_blob(key).await
    }

    async fn has_blob(&self, key: &str) -> anyhow::Result<bool> {
        (**self).has_blob(key).await
    }

    async fn delete_blob(&self, key: &str) -> anyhow::Result<()> {
        (**self).delete_blob(key).await
    }
}

#[async_trait]
impl<T: BlobStore + ?Sized> BlobStore for std::sync::Arc<T> {
    async fn write_blob(&self, key: &str, document: &Value) -> anyhow::Result<()> {
        (**self).write_blob(key, document).await
    }

    async fn read_blob(&self, key: &str) -> anyhow::Result<Value> {
        (**self).read_blob(key).await
    }

    async fn has_blob(&self, key: &str) -> anyhow::Result<bool> {
        (**self).has_blob(key).await
    }

    async fn delete_blob(&self, key: &str) -> anyhow::Result<()> {
        (**self).delete_blob(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn in_memory_round_trip() {
        let store = InMemoryBlobStore::new();
        store
            .write_blob("a", &json!({ "value": 1 }))
            .await
            .unwrap();

        assert!(store.has_blob("a").await.unwrap());
        assert_eq!(store.read_blob("a").await.unwrap(), json!({ "value": 1 }));

        store.delete_blob("a").await.unwrap();
        assert!(!store.has_blob("a").await.unwrap());
        assert!(store.read_blob("a").await.is_err());
    }

    #[tokio::test]
    async fn delete_of_absent_key_is_ok() {
        let store = InMemoryBlobStore::new();
        store.delete_blob("missing").await.unwrap();
    }
}
