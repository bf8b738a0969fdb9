//! Uploader
//!
//! Streams sealed primary files and orphaned replicas to the object store.
//! Concurrency is bounded by a semaphore; callers schedule retries through
//! the delay queue using the exponential backoff computed here. The `lz4`
//! encoding compresses into a scratch file first so the object length is
//! known before the upload starts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;

use crate::config::{Encoding, UploadConfig};
use crate::error::{Error, Result};
use crate::store::ObjectStore;

/// Object-store upload pipeline
pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    semaphore: Semaphore,
    config: UploadConfig,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, config: UploadConfig) -> Self {
        Self {
            store,
            semaphore: Semaphore::new(config.max_concurrent_uploads),
            config,
        }
    }

    /// Attempts allowed before a file is parked for the operator
    pub fn max_attempts(&self) -> u32 {
        self.config.max_upload_attempts
    }

    /// Backoff before retry `attempt` (1-based): exponential from the
    /// configured base, capped, with up to 25% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base();
        let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.config.max_backoff());
        let jitter = rand::thread_rng().gen_range(0.0..0.25);
        capped.mul_f64(1.0 + jitter)
    }

    /// Upload one sealed file to `key`, applying the namespace encoding.
    /// Blocks while the concurrent-upload budget is exhausted.
    pub async fn upload_file(&self, key: &str, path: &Path, encoding: Encoding) -> Result<()> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::ShuttingDown)?;

        match encoding {
            Encoding::Raw => {
                let mut file = tokio::fs::File::open(path).await?;
                let len = file.metadata().await?.len();
                self.store.put(key, &mut file, len).await?;
                tracing::info!(key, bytes = len, "upload complete");
                Ok(())
            }
            Encoding::Lz4 => {
                let scratch = compress_to_scratch(path.to_path_buf()).await?;
                let result = async {
                    let mut file = tokio::fs::File::open(&scratch).await?;
                    let len = file.metadata().await?.len();
                    self.store.put(key, &mut file, len).await?;
                    tracing::info!(key, bytes = len, "compressed upload complete");
                    Ok(())
                }
                .await;
                let _ = tokio::fs::remove_file(&scratch).await;
                result
            }
        }
    }
}

/// LZ4-compress `path` into a sibling scratch file and return its path
async fn compress_to_scratch(path: PathBuf) -> Result<PathBuf> {
    tokio::task::spawn_blocking(move || {
        let scratch = path.with_extension("lz4-scratch");
        let mut input = std::fs::File::open(&path)?;
        let output = std::fs::File::create(&scratch)?;
        let mut encoder = lz4_flex::frame::FrameEncoder::new(output);
        std::io::copy(&mut input, &mut encoder)?;
        encoder
            .finish()
            .map_err(|e| Error::Upload(format!("lz4 compression failed: {}", e)))?
            .sync_all()?;
        Ok(scratch)
    })
    .await
    .map_err(|e| Error::Internal(format!("compression task: {}", e)))?
}
