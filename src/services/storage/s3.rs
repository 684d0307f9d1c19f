use async_trait::async_trait;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::time::Duration;
use tracing::{debug, instrument};

use super::ObjectStorage;
use crate::core::errors::{StorageError, StorageResult};

/// S3-backed object storage
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
}

impl S3Storage {
    /// Build a client from the ambient AWS credential chain for `region`
    pub async fn from_env(region: &str) -> Self {
        let shared = aws_config::from_env()
            .region(Region::new(region.to_string()))
            .load()
            .await;

        Self {
            client: Client::new(&shared),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn upload(
        &self,
        bytes: Vec<u8>,
        key: &str,
        bucket: &str,
        content_type: &str,
    ) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .content_disposition("inline")
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StorageError::Upload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                reason: DisplayErrorContext(&e).to_string(),
            })?;

        debug!("Uploaded s3://{}/{}", bucket, key);
        Ok(())
    }

    async fn presigned_url(&self, key: &str, bucket: &str, ttl: Duration) -> StorageResult<String> {
        let presign_err = |reason: String| StorageError::Presign {
            bucket: bucket.to_string(),
            key: key.to_string(),
            reason,
        };

        let presigning = PresigningConfig::expires_in(ttl).map_err(|e| presign_err(e.to_string()))?;

        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| presign_err(DisplayErrorContext(&e).to_string()))?;

        Ok(request.uri().to_string())
    }
}
