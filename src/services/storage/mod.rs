//! Object storage collaborator
//!
//! Generated images, thumbnails and keyed composites are written here and
//! handed out as presigned URLs.

pub mod memory;
pub mod s3;

use async_trait::async_trait;
use std::time::Duration;

use crate::core::errors::StorageResult;

pub use memory::MemoryStorage;
pub use s3::S3Storage;

pub const CONTENT_TYPE_JPEG: &str = "image/jpeg";
pub const CONTENT_TYPE_PNG: &str = "image/png";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `bytes` under `bucket/key`
    async fn upload(
        &self,
        bytes: Vec<u8>,
        key: &str,
        bucket: &str,
        content_type: &str,
    ) -> StorageResult<()>;

    /// Time-limited retrieval URL for `bucket/key`
    async fn presigned_url(&self, key: &str, bucket: &str, ttl: Duration) -> StorageResult<String>;
}
