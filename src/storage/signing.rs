use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::{StorageError, StorageResult};

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 signer for object read URLs of the form
/// `{base}/objects/{bucket}/{key}?expires={unix}&signature={hex}`
#[derive(Clone)]
pub struct UrlSigner {
    mac: HmacSha256,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner").finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> StorageResult<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(StorageError::Unavailable(
                "URL signing secret must not be empty".to_string(),
            ));
        }
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|err| StorageError::Unavailable(format!("Invalid signing secret: {}", err)))?;
        Ok(Self { mac })
    }

    fn keyed(&self, bucket: &str, key: &str, expires: i64) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(bucket.as_bytes());
        mac.update(b"\n");
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        mac
    }

    pub fn sign(&self, bucket: &str, key: &str, expires: i64) -> String {
        hex::encode(self.keyed(bucket, key, expires).finalize().into_bytes())
    }

    pub fn signed_url(&self, base_url: &str, bucket: &str, key: &str, ttl: Duration) -> String {
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        format!(
            "{}/objects/{}/{}?expires={}&signature={}",
            base_url.trim_end_matches('/'),
            bucket,
            key,
            expires,
            self.sign(bucket, key, expires)
        )
    }

    pub fn verify(&self, bucket: &str, key: &str, expires: i64, signature: &str) -> StorageResult<()> {
        self.verify_at(bucket, key, expires, signature, Utc::now().timestamp())
    }

    pub fn verify_at(
        &self,
        bucket: &str,
        key: &str,
        expires: i64,
        signature: &str,
        now: i64,
    ) -> StorageResult<()> {
        if now > expires {
            return Err(StorageError::SignatureRejected("URL has expired".to_string()));
        }
        let signature = hex::decode(signature)
            .map_err(|_| StorageError::SignatureRejected("Malformed signature".to_string()))?;
        self.keyed(bucket, key, expires)
            .verify_slice(&signature)
            .map_err(|_| StorageError::SignatureRejected("Signature mismatch".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = UrlSigner::new("secret").unwrap();
        let signature = signer.sign("assets", "1/a.png", 2_000);
        assert!(signer.verify_at("assets", "1/a.png", 2_000, &signature, 1_000).is_ok());
    }

    #[test]
    fn test_expired_url_rejected() {
        let signer = UrlSigner::new("secret").unwrap();
        let signature = signer.sign("assets", "1/a.png", 1_000);
        let err = signer
            .verify_at("assets", "1/a.png", 1_000, &signature, 1_001)
            .unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_tampered_url_rejected() {
        let signer = UrlSigner::new("secret").unwrap();
        let signature = signer.sign("assets", "1/a.png", 2_000);
        assert!(signer.verify_at("assets", "1/b.png", 2_000, &signature, 0).is_err());
        assert!(signer.verify_at("assets", "1/a.png", 2_001, &signature, 0).is_err());
        assert!(signer.verify_at("assets", "1/a.png", 2_000, "zz", 0).is_err());

        let other = UrlSigner::new("other").unwrap();
        assert!(other.verify_at("assets", "1/a.png", 2_000, &signature, 0).is_err());
    }

    #[test]
    fn test_signed_url_shape() {
        let signer = UrlSigner::new("secret").unwrap();
        let url = signer.signed_url("http://localhost:3000/", "assets", "1/a.png", Duration::from_secs(60));
        assert!(url.starts_with("http://localhost:3000/objects/assets/1/a.png?expires="));
        assert!(url.contains("&signature="));
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(UrlSigner::new("").is_err());
    }
}
