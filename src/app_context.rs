use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde_json::Value;
use tracing::info;

use crate::config::LedgerConfig;
use crate::database::setup_database;
use crate::derivation::{Operation, OperationParameters};
use crate::errors::LedgerResult;
use crate::services::{
    AssetService, AssetStore, DerivationPipeline, DerivationService, DeriveOptions, PendingPolicy, PersonService,
    ReconcileService, TrainingService,
};
use crate::storage::ObjectStore;
use crate::transforms::caption::{caption_prefix, load_caption_prompt, CaptionSubject};
use crate::transforms::{
    AnthropicCaptioner, BackgroundRemovalTransform, CaptionTransform, CropTransform, FalBackgroundRemover,
    FalLoraTrainer, LoraTrainer, ReplicateBackgroundRemover, RotateTransform, TransformRegistry,
};

/// Shared context wiring the ledger services together for the CLI and HTTP layers.
#[derive(Clone)]
pub struct LedgerContext {
    db: DatabaseConnection,
    config: Arc<LedgerConfig>,
    store: AssetStore,
    persons: PersonService,
    assets: AssetService,
    derivations: DerivationService,
    pipeline: DerivationPipeline,
    reconciler: ReconcileService,
    training: TrainingService,
    registry: Arc<TransformRegistry>,
}

impl LedgerContext {
    /// Connect, migrate, build the object store and every configured transform
    pub async fn from_config(config: LedgerConfig) -> Result<Self> {
        let db = setup_database(&config.database_path).await?;
        let backend = config.storage.build()?;
        Ok(Self::new(db, config, backend))
    }

    pub fn new(db: DatabaseConnection, config: LedgerConfig, backend: Arc<dyn ObjectStore>) -> Self {
        let http = reqwest::Client::new();
        let persons = PersonService::new(db.clone());
        let providers = &config.providers;

        let mut registry = TransformRegistry::new();
        registry
            .register(Arc::new(CropTransform))
            .register(Arc::new(RotateTransform));

        let fal = providers
            .fal_key
            .as_ref()
            .map(|key| Arc::new(FalBackgroundRemover::new(http.clone(), key.clone())));
        let replicate = providers
            .replicate_api_token
            .as_ref()
            .map(|token| Arc::new(ReplicateBackgroundRemover::new(http.clone(), token.clone(), config.poll.clone())));
        if fal.is_some() || replicate.is_some() {
            registry.register(Arc::new(BackgroundRemovalTransform::new(fal, replicate)));
        }

        if let Some(key) = &providers.anthropic_api_key {
            let prompt = load_caption_prompt(config.caption_prompt_path.as_deref());
            let captioner = Arc::new(AnthropicCaptioner::new(http.clone(), key.clone()));
            registry.register(Arc::new(CaptionTransform::new(captioner, persons.clone(), prompt)));
        }

        let trainer: Option<Arc<dyn LoraTrainer>> = providers
            .fal_key
            .as_ref()
            .map(|key| -> Arc<dyn LoraTrainer> {
                Arc::new(FalLoraTrainer::new(http.clone(), key.clone(), config.poll.clone()))
            });

        info!(
            "Transforms available: {}",
            registry
                .operations()
                .iter()
                .map(Operation::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );
        Self::with_parts(db, config, backend, registry, trainer, http)
    }

    /// Assemble from explicit collaborators; tests pass fakes here
    pub fn with_parts(
        db: DatabaseConnection,
        config: LedgerConfig,
        backend: Arc<dyn ObjectStore>,
        registry: TransformRegistry,
        trainer: Option<Arc<dyn LoraTrainer>>,
        http: reqwest::Client,
    ) -> Self {
        let store = AssetStore::new(backend);
        let persons = PersonService::new(db.clone());
        let assets = AssetService::new(db.clone(), store.clone());
        let derivations = DerivationService::new(db.clone());
        let pipeline = DerivationPipeline::new(store.clone(), assets.clone(), derivations.clone(), http.clone());
        let reconciler = ReconcileService::new(derivations.clone(), store.clone());
        let training = TrainingService::new(
            db.clone(),
            persons.clone(),
            assets.clone(),
            derivations.clone(),
            trainer,
            http,
            config.share_url_ttl,
            config.training_timeout,
        );

        Self {
            db,
            config: Arc::new(config),
            store,
            persons,
            assets,
            derivations,
            pipeline,
            reconciler,
            training,
            registry: Arc::new(registry),
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn store(&self) -> &AssetStore {
        &self.store
    }

    pub fn persons(&self) -> &PersonService {
        &self.persons
    }

    pub fn assets(&self) -> &AssetService {
        &self.assets
    }

    pub fn derivations(&self) -> &DerivationService {
        &self.derivations
    }

    pub fn pipeline(&self) -> &DerivationPipeline {
        &self.pipeline
    }

    pub fn reconciler(&self) -> &ReconcileService {
        &self.reconciler
    }

    pub fn training(&self) -> &TrainingService {
        &self.training
    }

    pub fn registry(&self) -> &TransformRegistry {
        &self.registry
    }

    /// Parse request parameters. Caption requests get the configured model
    /// when none is given, and the person's current caption prefix.
    pub async fn parameters(&self, operation: Operation, mut value: Value) -> LedgerResult<OperationParameters> {
        if operation == Operation::Caption {
            if value.is_null() {
                value = Value::Object(Default::default());
            }
            if let Value::Object(map) = &mut value {
                map.entry("model")
                    .or_insert_with(|| Value::String(self.config.caption_model.clone()));
                map.remove("subject");
            }
        }

        let mut parameters = OperationParameters::from_value(operation, value)?;
        if let OperationParameters::Caption(request) = &mut parameters {
            let person = self.persons.get(request.person_id).await?;
            // Incomplete metadata is left for the transform to report
            request.subject = CaptionSubject::from_person(&person, Utc::now().date_naive())
                .ok()
                .map(|subject| caption_prefix(&subject));
        }
        Ok(parameters)
    }

    pub fn derive_options(&self) -> DeriveOptions {
        DeriveOptions {
            timeout: self.config.transform_timeout,
            pending_policy: PendingPolicy::Wait {
                deadline: self.config.transform_timeout + Duration::from_secs(10),
            },
            url_ttl: self.config.preview_url_ttl,
            ..DeriveOptions::default()
        }
    }
}
