//! Object store abstraction.
//!
//! Objects are immutable: `put_new` refuses to replace an existing key, so a
//! key that has been recorded in the ledger always names the same bytes.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::{StorageError, StorageResult};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket name recorded on every asset written through this store
    fn bucket(&self) -> &str;

    /// Write a new object, failing with `AlreadyExists` if `key` is taken
    async fn put_new(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<()>;

    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Remove an object; removing a missing object succeeds
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List keys, optionally restricted to a prefix, in lexical order
    async fn list(&self, prefix: Option<&str>) -> StorageResult<Vec<String>>;

    /// Time-limited read URL. Fails with `NotFound` when the object is missing.
    async fn signed_read_url(&self, key: &str, ttl: Duration) -> StorageResult<String>;

    /// Check the `expires` and `signature` query values of a URL from `signed_read_url`
    fn verify_signed_read(&self, key: &str, expires: i64, signature: &str) -> StorageResult<()>;
}

/// Keys are relative `/`-separated paths without empty or dot segments
pub fn validate_key(key: &str) -> StorageResult<()> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && !key.contains('\\')
        && key
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != ".." && !segment.starts_with('.'));

    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

pub fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "application/zip" => "zip",
        "application/json" => "json",
        "text/plain" => "txt",
        _ => "bin",
    }
}

pub fn content_type_for_key(key: &str) -> &'static str {
    let extension = key.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
    match extension.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "zip" => "application/zip",
        "json" => "application/json",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("7/0b6f.png").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/abs.png").is_err());
        assert!(validate_key("7/../etc/passwd").is_err());
        assert!(validate_key("7//x.png").is_err());
        assert!(validate_key("7/.hidden").is_err());
    }

    #[test]
    fn test_content_type_round_trip() {
        for content_type in ["image/png", "image/jpeg", "image/webp", "application/zip"] {
            let key = format!("1/a.{}", extension_for(content_type));
            assert_eq!(content_type_for_key(&key), content_type);
        }
        assert_eq!(content_type_for_key("1/noext"), "application/octet-stream");
    }
}
