//! Object Store Backends
//!
//! Sealed files are offloaded to a durable object store addressed by
//! `<namespace>/<fid-hex>` keys. [`ObjectStore`] is the seam between the
//! storage layer and the backend:
//!
//! - [`S3Store`] talks to any S3-family store
//! - [`LocalFsStore`] keeps objects as plain files, for development and tests

mod local_fs;
mod s3_store;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::config::{ObjectStoreConfig, UploadConfig};
use crate::error::{Error, Result};

pub use local_fs::LocalFsStore;
pub use s3_store::S3Store;

/// Backend-independent object store operations.
///
/// Ranges are half-open `[start, end)` byte intervals.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object of `len` bytes, replacing any previous version
    async fn put(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        len: u64,
    ) -> Result<()>;

    /// Fetch one byte range of an object
    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Bytes>;

    /// Whether the object exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remove the object; absent objects are not an error
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Build the configured backend
pub fn from_config(
    config: &ObjectStoreConfig,
    upload: &UploadConfig,
) -> Result<Arc<dyn ObjectStore>> {
    match config.backend.as_str() {
        "s3" => Ok(Arc::new(S3Store::new(config, upload.part_size)?)),
        "local_fs" => {
            let root = config
                .root
                .clone()
                .ok_or_else(|| Error::Config("object_store.root is required".into()))?;
            Ok(Arc::new(LocalFsStore::new(root)?))
        }
        other => Err(Error::Config(format!(
            "unknown object_store.backend {:?}",
            other
        ))),
    }
}
