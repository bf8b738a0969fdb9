//! S3-family object store backend
//!
//! Uses multipart uploads for files larger than one part so that a transient
//! failure never leaves a truncated object visible.

use async_trait::async_trait;
use bytes::Bytes;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::ObjectStore;
use crate::config::ObjectStoreConfig;
use crate::error::{Error, Result};

const CONTENT_TYPE: &str = "application/octet-stream";

/// Object store backed by an S3-compatible bucket
pub struct S3Store {
    bucket: Box<Bucket>,
    part_size: u64,
}

impl S3Store {
    pub fn new(config: &ObjectStoreConfig, part_size: u64) -> Result<Self> {
        let region = match &config.endpoint {
            Some(endpoint) => Region::Custom {
                region: config.region.clone(),
                endpoint: endpoint.clone(),
            },
            None => config
                .region
                .parse::<Region>()
                .map_err(|e| Error::Config(format!("object_store.region: {}", e)))?,
        };

        let credentials = match config.credentials()? {
            Some(c) => Credentials::new(Some(&c.access_key), Some(&c.secret_key), None, None, None),
            // Fall through to the ambient AWS credential chain
            None => Credentials::default(),
        }
        .map_err(|e| Error::Config(format!("object store credentials: {}", e)))?;

        let bucket = if config.path_style {
            Bucket::new(&config.bucket, region, credentials)?.with_path_style()
        } else {
            Bucket::new(&config.bucket, region, credentials)?
        };

        Ok(Self { bucket, part_size })
    }

    async fn put_multipart(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        len: u64,
    ) -> Result<()> {
        let mp = self
            .bucket
            .initiate_multipart_upload(key, CONTENT_TYPE)
            .await?;

        let mut parts = Vec::new();
        let mut part_number: u32 = 1;
        let mut remaining = len;

        while remaining > 0 {
            let this_part = remaining.min(self.part_size);
            let mut buf = vec![0u8; this_part as usize];
            if let Err(e) = reader.read_exact(&mut buf).await {
                let _ = self.bucket.abort_upload(key, &mp.upload_id).await;
                return Err(e.into());
            }

            match self
                .bucket
                .put_multipart_chunk(buf, key, part_number, &mp.upload_id, CONTENT_TYPE)
                .await
            {
                Ok(part) => parts.push(part),
                Err(e) => {
                    let _ = self.bucket.abort_upload(key, &mp.upload_id).await;
                    return Err(e.into());
                }
            }

            part_number += 1;
            remaining -= this_part;
        }

        let response = self
            .bucket
            .complete_multipart_upload(key, &mp.upload_id, parts)
            .await?;
        if !(200..300).contains(&response.status_code()) {
            return Err(Error::Upload(format!(
                "multipart completion for {} returned status {}",
                key,
                response.status_code()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        len: u64,
    ) -> Result<()> {
        if len > self.part_size {
            return self.put_multipart(key, reader, len).await;
        }

        let mut buf = Vec::with_capacity(len as usize);
        reader.take(len).read_to_end(&mut buf).await?;
        let response = self.bucket.put_object(key, &buf).await?;
        if !(200..300).contains(&response.status_code()) {
            return Err(Error::Upload(format!(
                "put of {} returned status {}",
                key,
                response.status_code()
            )));
        }
        Ok(())
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Bytes> {
        if end <= start {
            return Ok(Bytes::new());
        }
        // The wire header is an inclusive range.
        match self.bucket.get_object_range(key, start, Some(end - 1)).await {
            Ok(response) => match response.status_code() {
                200 | 206 => Ok(response.bytes().clone()),
                404 => Err(Error::NotFound(key.to_string())),
                other => Err(Error::Upload(format!(
                    "range get of {} returned status {}",
                    key, other
                ))),
            },
            Err(S3Error::HttpFailWithBody(404, _)) => Err(Error::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.bucket.head_object(key).await {
            Ok((_, code)) => Ok(code == 200),
            Err(S3Error::HttpFailWithBody(404, _)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self.bucket.delete_object(key).await {
            Ok(_) => Ok(()),
            Err(S3Error::HttpFailWithBody(404, _)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
