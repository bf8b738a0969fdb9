//! Local-filesystem object store backend
//!
//! Keeps each object as a plain file under a root directory. Writes land in
//! a temporary file and are renamed into place so readers never observe a
//! partially-written object.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};

use super::ObjectStore;
use crate::error::{Error, Result};

/// Object store rooted at a local directory
pub struct LocalFsStore {
    root: PathBuf,
}

impl LocalFsStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.split('/').any(|seg| seg.is_empty() || seg == "..") {
            return Err(Error::Internal(format!("invalid object key {:?}", key)));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalFsStore {
    async fn put(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        len: u64,
    ) -> Result<()> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension("partial");
        let mut file = tokio::fs::File::create(&tmp).await?;
        let copied = tokio::io::copy(&mut reader.take(len), &mut file).await?;
        if copied != len {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::Upload(format!(
                "short object body for {}: wanted {} bytes, got {}",
                key, len, copied
            )));
        }
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Bytes> {
        let path = self.object_path(key)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        if start > len {
            return Err(Error::NotFound(format!(
                "{}: range {}..{} beyond object of {} bytes",
                key, start, end, len
            )));
        }
        let end = end.min(len);
        if end <= start {
            return Ok(Bytes::new());
        }

        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.object_path(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
