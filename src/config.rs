use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::derivation::DEFAULT_CAPTION_MODEL;
use crate::poll::PollPolicy;
use crate::storage::{StorageConfig, StorageType};

/// Credentials for the hosted transform and training services. A missing
/// credential disables the matching transform rather than failing startup.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub fal_key: Option<String>,
    pub replicate_api_token: Option<String>,
    pub anthropic_api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub database_path: String,
    pub storage: StorageConfig,
    pub providers: ProviderConfig,
    /// Model used when a caption request does not name one
    pub caption_model: String,
    pub caption_prompt_path: Option<PathBuf>,
    pub transform_timeout: Duration,
    pub preview_url_ttl: Duration,
    pub share_url_ttl: Duration,
    /// Pending rows older than this are treated as abandoned
    pub stale_after: Duration,
    pub training_timeout: Duration,
    pub poll: PollPolicy,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_path: "derivation-ledger.db".to_string(),
            storage: StorageConfig::default(),
            providers: ProviderConfig::default(),
            caption_model: DEFAULT_CAPTION_MODEL.to_string(),
            caption_prompt_path: None,
            transform_timeout: Duration::from_secs(120),
            preview_url_ttl: Duration::from_secs(15 * 60),
            share_url_ttl: Duration::from_secs(60 * 60),
            stale_after: Duration::from_secs(15 * 60),
            training_timeout: Duration::from_secs(30 * 60),
            poll: PollPolicy::default(),
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).map(|value| value.trim().to_string()).filter(|v| !v.is_empty());
        let secs = |name: &str, default: Duration| {
            var(name)
                .and_then(|value| match value.parse::<u64>() {
                    Ok(secs) => Some(Duration::from_secs(secs)),
                    Err(_) => {
                        warn!("Ignoring {}={}: expected whole seconds", name, value);
                        None
                    }
                })
                .unwrap_or(default)
        };
        let millis = |name: &str, default: Duration| {
            var(name)
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        let defaults = Self::default();

        let signing_secret = var("LEDGER_SIGNING_SECRET").unwrap_or_else(|| {
            warn!("LEDGER_SIGNING_SECRET is not set; signed URLs will not survive a restart");
            format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
        });
        let storage_type = match var("LEDGER_STORAGE_ROOT").as_deref() {
            Some(":memory:") => StorageType::Memory,
            Some(root) => StorageType::Local {
                root: PathBuf::from(root),
            },
            None => defaults.storage.storage_type.clone(),
        };
        let storage = StorageConfig {
            storage_type,
            bucket: var("LEDGER_STORAGE_BUCKET").unwrap_or(defaults.storage.bucket.clone()),
            public_base_url: var("LEDGER_PUBLIC_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.storage.public_base_url.clone()),
            signing_secret,
        };

        let poll = PollPolicy {
            initial_delay: millis("LEDGER_POLL_INITIAL_MS", defaults.poll.initial_delay),
            max_delay: millis("LEDGER_POLL_MAX_MS", defaults.poll.max_delay),
            ..defaults.poll.clone()
        };

        Self {
            database_path: var("LEDGER_DATABASE").unwrap_or(defaults.database_path.clone()),
            storage,
            providers: ProviderConfig {
                fal_key: var("FAL_KEY"),
                replicate_api_token: var("REPLICATE_API_TOKEN"),
                anthropic_api_key: var("ANTHROPIC_API_KEY"),
            },
            caption_model: var("LEDGER_CAPTION_MODEL").unwrap_or(defaults.caption_model.clone()),
            caption_prompt_path: var("LEDGER_CAPTION_PROMPT_PATH").map(PathBuf::from),
            transform_timeout: secs("LEDGER_TRANSFORM_TIMEOUT_SECS", defaults.transform_timeout),
            preview_url_ttl: secs("LEDGER_PREVIEW_TTL_SECS", defaults.preview_url_ttl),
            share_url_ttl: secs("LEDGER_SHARE_TTL_SECS", defaults.share_url_ttl),
            stale_after: secs("LEDGER_STALE_AFTER_SECS", defaults.stale_after),
            training_timeout: secs("LEDGER_TRAINING_TIMEOUT_SECS", defaults.training_timeout),
            poll,
        }
    }

    /// In-memory database and store, used by tests and throwaway runs
    pub fn ephemeral(signing_secret: &str) -> Self {
        Self {
            database_path: ":memory:".to_string(),
            storage: StorageConfig::memory(signing_secret),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = LedgerConfig::from_lookup(lookup(&[]));
        assert_eq!(config.database_path, "derivation-ledger.db");
        assert_eq!(config.storage.bucket, "assets");
        assert_eq!(config.transform_timeout, Duration::from_secs(120));
        assert_eq!(config.share_url_ttl, Duration::from_secs(3600));
        assert_eq!(config.caption_model, DEFAULT_CAPTION_MODEL);
        assert!(config.providers.fal_key.is_none());
        // A random secret is generated
        assert_eq!(config.storage.signing_secret.len(), 64);
    }

    #[test]
    fn test_reads_overrides() {
        let config = LedgerConfig::from_lookup(lookup(&[
            ("LEDGER_DATABASE", "/tmp/ledger.db"),
            ("LEDGER_STORAGE_ROOT", "/srv/objects"),
            ("LEDGER_PUBLIC_BASE_URL", "https://media.example.com/"),
            ("LEDGER_SIGNING_SECRET", "s3cret"),
            ("FAL_KEY", "fal-key"),
            ("LEDGER_TRANSFORM_TIMEOUT_SECS", "30"),
            ("LEDGER_POLL_INITIAL_MS", "50"),
        ]));
        assert_eq!(config.database_path, "/tmp/ledger.db");
        assert_eq!(
            config.storage.storage_type,
            StorageType::Local {
                root: PathBuf::from("/srv/objects")
            }
        );
        assert_eq!(config.storage.public_base_url, "https://media.example.com");
        assert_eq!(config.storage.signing_secret, "s3cret");
        assert_eq!(config.providers.fal_key.as_deref(), Some("fal-key"));
        assert_eq!(config.transform_timeout, Duration::from_secs(30));
        assert_eq!(config.poll.initial_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_bad_numbers_fall_back() {
        let config = LedgerConfig::from_lookup(lookup(&[("LEDGER_STALE_AFTER_SECS", "soon"), ("FAL_KEY", "  ")]));
        assert_eq!(config.stale_after, Duration::from_secs(900));
        assert!(config.providers.fal_key.is_none());
    }

    #[test]
    fn test_memory_storage_root() {
        let config = LedgerConfig::from_lookup(lookup(&[("LEDGER_STORAGE_ROOT", ":memory:")]));
        assert_eq!(config.storage.storage_type, StorageType::Memory);
    }
}
