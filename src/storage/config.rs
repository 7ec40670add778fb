use std::path::PathBuf;
use std::sync::Arc;

use super::{LocalObjectStore, MemoryObjectStore, ObjectStore, UrlSigner};
use crate::errors::StorageResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageType {
    /// Filesystem storage rooted at `root`
    Local { root: PathBuf },
    /// Process-local storage, lost on exit
    Memory,
}

impl Default for StorageType {
    fn default() -> Self {
        StorageType::Local {
            root: PathBuf::from("storage"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub storage_type: StorageType,
    pub bucket: String,
    /// Prefix for signed URLs, normally the externally reachable server address
    pub public_base_url: String,
    pub signing_secret: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::default(),
            bucket: "assets".to_string(),
            public_base_url: "http://localhost:3000".to_string(),
            signing_secret: String::new(),
        }
    }
}

impl StorageConfig {
    pub fn local(root: PathBuf, signing_secret: impl Into<String>) -> Self {
        Self {
            storage_type: StorageType::Local { root },
            signing_secret: signing_secret.into(),
            ..Default::default()
        }
    }

    pub fn memory(signing_secret: impl Into<String>) -> Self {
        Self {
            storage_type: StorageType::Memory,
            signing_secret: signing_secret.into(),
            ..Default::default()
        }
    }

    pub fn build(&self) -> StorageResult<Arc<dyn ObjectStore>> {
        let signer = UrlSigner::new(&self.signing_secret)?;
        let store: Arc<dyn ObjectStore> = match &self.storage_type {
            StorageType::Local { root } => {
                std::fs::create_dir_all(root.join(&self.bucket))?;
                Arc::new(LocalObjectStore::new(
                    root.clone(),
                    self.bucket.clone(),
                    self.public_base_url.clone(),
                    signer,
                ))
            }
            StorageType::Memory => Arc::new(MemoryObjectStore::new(
                self.bucket.clone(),
                self.public_base_url.clone(),
                signer,
            )),
        };
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_local_creates_bucket_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = StorageConfig::local(dir.path().to_path_buf(), "secret");
        let store = config.build().unwrap();
        assert_eq!(store.bucket(), "assets");
        assert!(dir.path().join("assets").is_dir());
    }

    #[test]
    fn test_build_requires_secret() {
        assert!(StorageConfig::memory("").build().is_err());
    }
}
