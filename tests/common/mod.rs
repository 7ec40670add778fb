//! Shared fixtures for integration tests: in-memory database and object
//! store, a seeded person, generated PNGs and scriptable transforms.
#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};

use derivation_ledger::app_context::LedgerContext;
use derivation_ledger::config::LedgerConfig;
use derivation_ledger::database::entities::{assets, persons};
use derivation_ledger::database::setup_database;
use derivation_ledger::derivation::{Operation, OperationParameters};
use derivation_ledger::errors::{TransformError, TransformResult};
use derivation_ledger::poll::PollPolicy;
use derivation_ledger::services::{DeriveOptions, NewPerson, PendingPolicy};
use derivation_ledger::storage::{MemoryObjectStore, ObjectStore, UrlSigner};
use derivation_ledger::transforms::{
    LoraTrainer, Transform, TransformInput, TransformOutput, TransformRegistry, TrainingOutputs,
};

pub const SIGNING_SECRET: &str = "integration-test-secret";

pub struct TestLedger {
    pub ctx: LedgerContext,
    pub store: Arc<MemoryObjectStore>,
}

pub async fn setup() -> TestLedger {
    setup_with(TransformRegistry::new(), None).await
}

pub async fn setup_with(registry: TransformRegistry, trainer: Option<Arc<dyn LoraTrainer>>) -> TestLedger {
    setup_on(":memory:", registry, trainer).await
}

/// Same as `setup_with` but against the given database path, so a file path
/// gets a real connection pool
pub async fn setup_on(
    database_path: &str,
    registry: TransformRegistry,
    trainer: Option<Arc<dyn LoraTrainer>>,
) -> TestLedger {
    let mut config = LedgerConfig::ephemeral(SIGNING_SECRET);
    config.database_path = database_path.to_string();
    let db = setup_database(database_path).await.expect("test database");
    let store = Arc::new(MemoryObjectStore::new(
        config.storage.bucket.clone(),
        config.storage.public_base_url.clone(),
        UrlSigner::new(SIGNING_SECRET).expect("signer"),
    ));
    let backend: Arc<dyn ObjectStore> = store.clone();
    let ctx = LedgerContext::with_parts(db, config, backend, registry, trainer, reqwest::Client::new());
    TestLedger { ctx, store }
}

pub async fn create_person(ctx: &LedgerContext) -> persons::Model {
    ctx.persons()
        .create(NewPerson {
            first_name: "Mei".to_string(),
            last_name: "Tanaka".to_string(),
            ethnicity: "asian".to_string(),
            gender: "female".to_string(),
            birthdate: None,
            age: Some(30),
            trigger_word: Some("ZXY".to_string()),
        })
        .await
        .expect("person")
}

/// Solid-colour PNG of the given size
pub fn png_bytes(width: u32, height: u32) -> Bytes {
    let image = RgbaImage::from_pixel(width, height, Rgba([200, 30, 30, 255]));
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(image)
        .write_to(&mut buffer, ImageFormat::Png)
        .expect("encode png");
    Bytes::from(buffer.into_inner())
}

pub async fn upload_png(ctx: &LedgerContext, owner_id: i32, width: u32, height: u32) -> assets::Model {
    ctx.assets()
        .upload(owner_id, png_bytes(width, height), "image/png")
        .await
        .expect("upload")
}

pub fn crop(x: u32, y: u32, width: u32, height: u32) -> OperationParameters {
    OperationParameters::from_value(
        Operation::Crop,
        serde_json::json!({ "x": x, "y": y, "width": width, "height": height }),
    )
    .expect("crop parameters")
}

/// Options with short polling so waiting tests finish quickly
pub fn fast_options() -> DeriveOptions {
    DeriveOptions {
        timeout: Duration::from_secs(5),
        pending_policy: PendingPolicy::Wait {
            deadline: Duration::from_secs(5),
        },
        url_ttl: Duration::from_secs(60),
        wait_poll: PollPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            ..PollPolicy::default()
        },
    }
}

#[derive(Debug, Clone)]
pub enum Behavior {
    Binary(Bytes, &'static str),
    RemoteUrl(String),
    Text(String),
    Fail(String),
}

/// Transform that counts invocations and returns a scripted result after a delay
pub struct ScriptedTransform {
    operation: Operation,
    behavior: Behavior,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedTransform {
    pub fn new(operation: Operation, behavior: Behavior) -> Self {
        Self {
            operation,
            behavior,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transform for ScriptedTransform {
    fn operation(&self) -> Operation {
        self.operation
    }

    async fn apply(&self, _input: TransformInput, _parameters: &OperationParameters) -> TransformResult<TransformOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.behavior {
            Behavior::Binary(bytes, content_type) => Ok(TransformOutput::Binary {
                bytes: bytes.clone(),
                content_type: content_type.to_string(),
            }),
            Behavior::RemoteUrl(url) => Ok(TransformOutput::RemoteUrl {
                url: url.clone(),
                content_type: None,
            }),
            Behavior::Text(text) => Ok(TransformOutput::Text(text.clone())),
            Behavior::Fail(message) => Err(TransformError::service("scripted", message.clone())),
        }
    }
}

/// Trainer that answers immediately with inline files
pub struct InlineTrainer {
    pub calls: AtomicUsize,
}

impl InlineTrainer {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LoraTrainer for InlineTrainer {
    fn service(&self) -> &str {
        "inline"
    }

    fn model(&self) -> &str {
        "inline-lora"
    }

    async fn train(&self, bundle_url: &str, trigger_word: &str) -> TransformResult<TrainingOutputs> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !bundle_url.contains("signature=") {
            return Err(TransformError::InvalidInput("bundle URL is not signed".to_string()));
        }
        let config = format!("{{\"trigger_word\":\"{}\"}}", trigger_word);
        Ok(TrainingOutputs {
            weights: derivation_ledger::transforms::RemoteFile {
                url: derivation_ledger::transforms::http::to_data_uri("application/octet-stream", b"weights"),
                file_name: Some("pytorch_lora_weights.safetensors".to_string()),
                content_type: None,
            },
            config: derivation_ledger::transforms::RemoteFile {
                url: derivation_ledger::transforms::http::to_data_uri("application/json", config.as_bytes()),
                file_name: Some("config.json".to_string()),
                content_type: None,
            },
        })
    }
}
