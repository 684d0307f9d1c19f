use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use super::ObjectStorage;
use crate::core::errors::{StorageError, StorageResult};

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Arc<Vec<u8>>,
    pub content_type: String,
}

/// Process-local object storage for development and tests
#[derive(Default, Clone)]
pub struct MemoryStorage {
    objects: Arc<DashMap<(String, String), StoredObject>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Keys stored in `bucket`, sorted
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().0 == bucket)
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn upload(
        &self,
        bytes: Vec<u8>,
        key: &str,
        bucket: &str,
        content_type: &str,
    ) -> StorageResult<()> {
        self.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                bytes: Arc::new(bytes),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn presigned_url(&self, key: &str, bucket: &str, ttl: Duration) -> StorageResult<String> {
        if !self.objects.contains_key(&(bucket.to_string(), key.to_string())) {
            return Err(StorageError::Presign {
                bucket: bucket.to_string(),
                key: key.to_string(),
                reason: "no such object".to_string(),
            });
        }
        Ok(format!("memory://{}/{}?expires={}", bucket, key, ttl.as_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_then_presign() {
        let storage = MemoryStorage::new();
        storage
            .upload(vec![1, 2, 3], "a.png", "masked-images", "image/png")
            .await
            .unwrap();

        let url = storage
            .presigned_url("a.png", "masked-images", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(url, "memory://masked-images/a.png?expires=60");
        assert_eq!(storage.keys("masked-images"), vec!["a.png".to_string()]);
        assert_eq!(storage.get("masked-images", "a.png").unwrap().content_type, "image/png");
    }

    #[tokio::test]
    async fn test_presign_missing_object_fails() {
        let storage = MemoryStorage::new();
        let result = storage
            .presigned_url("missing.png", "masked-images", Duration::from_secs(60))
            .await;
        assert!(matches!(result, Err(StorageError::Presign { .. })));
    }
}
