use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::database::entities::assets;
use crate::errors::{StorageError, StorageResult};
use crate::storage::{extension_for, ObjectStore};

/// Writes immutable objects and describes them as (unsaved) asset rows.
/// Recording the row is the caller's job.
#[derive(Clone)]
pub struct AssetStore {
    backend: Arc<dyn ObjectStore>,
}

impl AssetStore {
    pub fn new(backend: Arc<dyn ObjectStore>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn ObjectStore> {
        &self.backend
    }

    pub fn bucket(&self) -> &str {
        self.backend.bucket()
    }

    /// Fresh key scoped by owner: `{owner_id}/{uuid}.{ext}`
    pub fn generate_key(owner_id: i32, content_type: &str) -> String {
        format!("{}/{}.{}", owner_id, Uuid::new_v4(), extension_for(content_type))
    }

    pub fn describe(&self, owner_id: i32, key: &str, bytes: &[u8], content_type: &str) -> assets::Model {
        assets::Model {
            id: Uuid::new_v4(),
            owner_id,
            bucket: self.backend.bucket().to_string(),
            storage_key: key.to_string(),
            content_type: content_type.to_string(),
            size_bytes: bytes.len() as i64,
            checksum: hex::encode(Sha256::digest(bytes)),
            created_at: Utc::now(),
        }
    }

    pub async fn put(&self, owner_id: i32, bytes: Bytes, content_type: &str) -> StorageResult<assets::Model> {
        let key = Self::generate_key(owner_id, content_type);
        self.put_at(owner_id, &key, bytes, content_type).await
    }

    /// Write under a key chosen ahead of time, used when the key is staged first
    pub async fn put_at(
        &self,
        owner_id: i32,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> StorageResult<assets::Model> {
        let asset = self.describe(owner_id, key, &bytes, content_type);
        self.backend.put_new(key, bytes, content_type).await?;
        debug!("Stored asset {} at {}", asset.id, key);
        Ok(asset)
    }

    /// Describe an object that is already in the store, e.g. a staged write
    /// whose ledger update never happened
    pub async fn adopt(&self, owner_id: i32, key: &str, content_type: &str) -> StorageResult<assets::Model> {
        let bytes = self.backend.get(key).await?;
        Ok(self.describe(owner_id, key, &bytes, content_type))
    }

    fn check_bucket(&self, asset: &assets::Model) -> StorageResult<()> {
        if asset.bucket == self.backend.bucket() {
            Ok(())
        } else {
            Err(StorageError::NotFound(format!("{}/{}", asset.bucket, asset.storage_key)))
        }
    }

    pub async fn signed_read_url(&self, asset: &assets::Model, ttl: Duration) -> StorageResult<String> {
        self.check_bucket(asset)?;
        self.backend.signed_read_url(&asset.storage_key, ttl).await
    }

    pub async fn get(&self, asset: &assets::Model) -> StorageResult<Bytes> {
        self.check_bucket(asset)?;
        self.backend.get(&asset.storage_key).await
    }

    pub async fn contains(&self, asset: &assets::Model) -> StorageResult<bool> {
        if asset.bucket != self.backend.bucket() {
            return Ok(false);
        }
        self.backend.exists(&asset.storage_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryObjectStore, UrlSigner};

    fn store() -> AssetStore {
        AssetStore::new(Arc::new(MemoryObjectStore::new(
            "assets",
            "http://localhost:3000",
            UrlSigner::new("secret").unwrap(),
        )))
    }

    #[tokio::test]
    async fn test_put_generates_unique_keys() {
        let store = store();
        let a = store.put(3, Bytes::from_static(b"same"), "image/png").await.unwrap();
        let b = store.put(3, Bytes::from_static(b"same"), "image/png").await.unwrap();

        assert_ne!(a.storage_key, b.storage_key);
        assert!(a.storage_key.starts_with("3/"));
        assert!(a.storage_key.ends_with(".png"));
        assert_eq!(a.checksum, b.checksum);
        assert_eq!(a.size_bytes, 4);
    }

    #[tokio::test]
    async fn test_signed_url_detects_drift() {
        let store = store();
        let asset = store.put(1, Bytes::from_static(b"x"), "image/jpeg").await.unwrap();
        assert!(store.signed_read_url(&asset, Duration::from_secs(300)).await.is_ok());

        store.backend().delete(&asset.storage_key).await.unwrap();
        let err = store
            .signed_read_url(&asset, Duration::from_secs(300))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_round_trips_bytes() {
        let store = store();
        let asset = store.put(1, Bytes::from_static(b"abc"), "image/webp").await.unwrap();
        assert_eq!(store.get(&asset).await.unwrap(), Bytes::from_static(b"abc"));

        let foreign = assets::Model {
            bucket: "elsewhere".to_string(),
            ..asset
        };
        assert!(store.get(&foreign).await.unwrap_err().is_not_found());
    }
}
