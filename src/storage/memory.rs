use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::backend::{validate_key, ObjectStore};
use super::signing::UrlSigner;
use crate::errors::{StorageError, StorageResult};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
}

/// In-process object store for tests and throwaway runs
pub struct MemoryObjectStore {
    bucket: String,
    base_url: String,
    signer: UrlSigner,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    unavailable: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>, base_url: impl Into<String>, signer: UrlSigner) -> Self {
        Self {
            bucket: bucket.into(),
            base_url: base_url.into(),
            signer,
            objects: RwLock::new(BTreeMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every call fail with `StorageError::Unavailable` until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    pub async fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|object| object.content_type.clone())
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable(format!(
                "bucket '{}' is unavailable",
                self.bucket
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_new(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<()> {
        self.check_available()?;
        validate_key(key)?;
        let mut objects = self.objects.write().await;
        if objects.contains_key(key) {
            return Err(StorageError::AlreadyExists(key.to_string()));
        }
        objects.insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.check_available()?;
        self.objects
            .read()
            .await
            .get(key)
            .map(|object| object.data.clone())
            .ok_or_else(|| StorageError::NotFound(format!("{}/{}", self.bucket, key)))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.check_available()?;
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.check_available()?;
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>) -> StorageResult<Vec<String>> {
        self.check_available()?;
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|key| prefix.map_or(true, |p| key.starts_with(p)))
            .cloned()
            .collect())
    }

    async fn signed_read_url(&self, key: &str, ttl: Duration) -> StorageResult<String> {
        if !self.exists(key).await? {
            return Err(StorageError::NotFound(format!("{}/{}", self.bucket, key)));
        }
        Ok(self.signer.signed_url(&self.base_url, &self.bucket, key, ttl))
    }

    fn verify_signed_read(&self, key: &str, expires: i64, signature: &str) -> StorageResult<()> {
        self.signer.verify(&self.bucket, key, expires, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryObjectStore {
        MemoryObjectStore::new("test", "http://localhost", UrlSigner::new("k").unwrap())
    }

    #[tokio::test]
    async fn test_put_new_rejects_duplicates() {
        let store = store();
        store.put_new("1/a.png", Bytes::from_static(b"a"), "image/png").await.unwrap();
        assert!(matches!(
            store.put_new("1/a.png", Bytes::from_static(b"b"), "image/png").await,
            Err(StorageError::AlreadyExists(_))
        ));
        assert_eq!(store.content_type("1/a.png").await.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = store();
        store.set_unavailable(true);
        let err = store
            .put_new("1/a.png", Bytes::from_static(b"a"), "image/png")
            .await
            .unwrap_err();
        assert!(err.is_transient());
        store.set_unavailable(false);
        assert!(store.is_empty().await);
    }
}
