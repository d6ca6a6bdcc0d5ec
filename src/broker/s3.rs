//! S3 access: presigned upload/download URLs and a reachability probe.

use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client as S3Client;
use std::time::Duration;

use crate::error::{Error, Result};

pub struct S3Service {
    client: S3Client,
    bucket: String,
}

impl S3Service {
    pub fn new(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub async fn health(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| Error::S3(format!("HeadBucket failed: {e}")))?;
        Ok(())
    }

    /// Presigned PUT URL for a pending object upload.
    pub async fn presign_put(&self, key: &str, lifetime: Duration) -> Result<String> {
        let config = PresigningConfig::expires_in(lifetime)
            .map_err(|e| Error::S3(format!("invalid presign lifetime: {e}")))?;
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/octet-stream")
            .presigned(config)
            .await
            .map_err(|e| Error::S3(format!("PresignPutObject failed: {e}")))?;
        Ok(request.uri().to_string())
    }

    /// Presigned GET URL for a ready object.
    pub async fn presign_get(&self, key: &str, lifetime: Duration) -> Result<String> {
        let config = PresigningConfig::expires_in(lifetime)
            .map_err(|e| Error::S3(format!("invalid presign lifetime: {e}")))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| Error::S3(format!("PresignGetObject failed: {e}")))?;
        Ok(request.uri().to_string())
    }
}
