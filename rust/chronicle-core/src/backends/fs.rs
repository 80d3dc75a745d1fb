//! Filesystem blob store.
//!
//! One JSON file per blob under a root directory. Keys are sanitized into
//! file names, so index keys like `index:my-workflow` and content-hash
//! record keys both map to stable paths.
//!
//! # Example
//!
//! ```rust,ignore
//! use chronicle_core::backends::FileBlobStore;
//!
//! let store = FileBlobStore::new("./data/workflows").await?;
//! store.write_blob("index:demo", &serde_json::json!({ "records": [] })).await?;
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;

use super::BlobStore;

/// Blob store backed by a directory of JSON files.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create blob directory {}", root.display()))?;
        Ok(Self { root })
    }

    /// Directory this store writes into.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        let sanitized: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{sanitized}.json"))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn write_blob(&self, key: &str, document: &Value) -> anyhow::Result<()> {
        let path = self.blob_path(key);
        let bytes = serde_json::to_vec_pretty(document)?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write blob {}", path.display()))
    }

    async fn read_blob(&self, key: &str) -> anyhow::Result<Value> {
        let path = self.blob_path(key);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read blob {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("blob {} is not valid JSON", path.display()))
    }

    async fn has_blob(&self, key: &str) -> anyhow::Result<bool> {
        Ok(tokio::fs::try_exists(self.blob_path(key)).await?)
    }

    async fn delete_blob(&self, key: &str) -> anyhow::Result<()> {
        match tokio::fs::remove_file(self.blob_path(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
