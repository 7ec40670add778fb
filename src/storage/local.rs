//! Local filesystem object store.
//!
//! Objects live under `{root}/{bucket}/{key}`. Writes go to a hidden temp file
//! in the same directory which is then hard-linked into place, so a key
//! either holds the complete object or does not exist.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use super::backend::{validate_key, ObjectStore};
use super::signing::UrlSigner;
use crate::errors::{StorageError, StorageResult};

pub struct LocalObjectStore {
    bucket_path: PathBuf,
    bucket: String,
    base_url: String,
    signer: UrlSigner,
}

impl LocalObjectStore {
    pub fn new(root: PathBuf, bucket: String, base_url: String, signer: UrlSigner) -> Self {
        Self {
            bucket_path: root.join(&bucket),
            bucket,
            base_url,
            signer,
        }
    }

    fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(key
            .split('/')
            .fold(self.bucket_path.clone(), |path, segment| path.join(segment)))
    }

    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_new(&self, key: &str, data: Bytes, _content_type: &str) -> StorageResult<()> {
        let path = self.key_path(key)?;
        self.ensure_parent(&path).await?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

        if let Err(err) = fs::write(&temp_path, &data).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }

        let linked = fs::hard_link(&temp_path, &path).await;
        let _ = fs::remove_file(&temp_path).await;

        match linked {
            Ok(()) => {
                debug!("Stored {} bytes at {}/{}", data.len(), self.bucket, key);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(StorageError::AlreadyExists(key.to_string()))
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key)?;
        let data = fs::read(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::NotFound(format!("{}/{}", self.bucket, key))
            } else {
                StorageError::Io(err)
            }
        })?;
        Ok(Bytes::from(data))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn list(&self, prefix: Option<&str>) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.bucket_path.clone(), String::new())];

        while let Some((dir, relative)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StorageError::Io(err)),
            };

            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let key = if relative.is_empty() {
                    name
                } else {
                    format!("{}/{}", relative, name)
                };

                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), key));
                } else if prefix.map_or(true, |p| key.starts_with(p)) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
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
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> LocalObjectStore {
        LocalObjectStore::new(
            dir.path().to_path_buf(),
            "assets".to_string(),
            "http://localhost:3000".to_string(),
            UrlSigner::new("test-secret").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store
            .put_new("1/a.png", Bytes::from_static(b"png-bytes"), "image/png")
            .await
            .unwrap();

        assert_eq!(store.get("1/a.png").await.unwrap(), Bytes::from_static(b"png-bytes"));
        assert!(store.exists("1/a.png").await.unwrap());
        assert!(dir.path().join("assets").join("1").join("a.png").exists());
    }

    #[tokio::test]
    async fn test_put_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.put_new("1/a.png", Bytes::from_static(b"first"), "image/png").await.unwrap();
        let err = store
            .put_new("1/a.png", Bytes::from_static(b"second"), "image/png")
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::AlreadyExists(_)));
        assert_eq!(store.get("1/a.png").await.unwrap(), Bytes::from_static(b"first"));
        assert_eq!(store.list(None).await.unwrap(), vec!["1/a.png".to_string()]);
    }

    #[tokio::test]
    async fn test_list_with_prefix_skips_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.put_new("1/a.png", Bytes::from_static(b"a"), "image/png").await.unwrap();
        store.put_new("1/b.png", Bytes::from_static(b"b"), "image/png").await.unwrap();
        store.put_new("2/c.png", Bytes::from_static(b"c"), "image/png").await.unwrap();
        std::fs::write(dir.path().join("assets/1/.partial.tmp"), b"x").unwrap();

        assert_eq!(
            store.list(Some("1/")).await.unwrap(),
            vec!["1/a.png".to_string(), "1/b.png".to_string()]
        );
        assert_eq!(store.list(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_missing_object() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert!(store.get("1/missing.png").await.unwrap_err().is_not_found());
        assert!(!store.exists("1/missing.png").await.unwrap());
        assert!(store
            .signed_read_url("1/missing.png", Duration::from_secs(60))
            .await
            .unwrap_err()
            .is_not_found());
        store.delete("1/missing.png").await.unwrap();
    }

    #[tokio::test]
    async fn test_signed_url_verifies() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put_new("1/a.png", Bytes::from_static(b"a"), "image/png").await.unwrap();

        let url = store.signed_read_url("1/a.png", Duration::from_secs(60)).await.unwrap();
        let parsed = url::Url::parse(&url).unwrap();
        let query: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        let expires: i64 = query["expires"].parse().unwrap();

        assert_eq!(parsed.path(), "/objects/assets/1/a.png");
        assert!(store.verify_signed_read("1/a.png", expires, &query["signature"]).is_ok());
        assert!(store.verify_signed_read("1/b.png", expires, &query["signature"]).is_err());
    }

    #[tokio::test]
    async fn test_rejects_traversal_keys() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let err = store
            .put_new("../escape.png", Bytes::from_static(b"x"), "image/png")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }
}
