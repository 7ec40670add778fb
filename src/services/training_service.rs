//! LoRA training runs.
//!
//! A run bundles captioned images into a zip asset, hands a signed URL for
//! the bundle to the trainer and re-stores the weights and config it returns.
//! Failures after the run row exists are recorded on the row, not returned.

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set};
use serde::Deserialize;
use tokio::time::timeout;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::asset_service::record_asset;
use super::{AssetService, DerivationService, PersonService};
use crate::database::entities::training_runs::TrainingStatus;
use crate::database::entities::{assets, training_runs};
use crate::derivation::Operation;
use crate::errors::{LedgerError, LedgerResult, StorageError, TransformError};
use crate::storage::extension_for;
use crate::transforms::http::fetch;
use crate::transforms::{LoraTrainer, RemoteFile};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingRequest {
    #[serde(alias = "person_id")]
    pub person_id: i32,
    #[serde(default, alias = "trigger", alias = "trigger_word")]
    pub trigger_word: Option<String>,
    #[serde(alias = "image_asset_ids")]
    pub image_asset_ids: Vec<Uuid>,
}

/// One image and its caption, in bundle order
#[derive(Debug, Clone)]
pub struct BundleEntry {
    pub content_type: String,
    pub image: Bytes,
    pub caption: String,
}

/// Zip of `001.png` / `001.txt` pairs numbered from one
pub fn build_bundle(entries: &[BundleEntry]) -> Result<Vec<u8>, zip::result::ZipError> {
    let mut buffer: Vec<u8> = Vec::new();
    {
        let mut zip = ZipWriter::new(Cursor::new(&mut buffer));
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(0o644);

        for (index, entry) in entries.iter().enumerate() {
            let stem = format!("{:03}", index + 1);
            zip.start_file(format!("{}.{}", stem, extension_for(&entry.content_type)), options)?;
            zip.write_all(&entry.image)?;
            zip.start_file(format!("{}.txt", stem), options)?;
            zip.write_all(entry.caption.as_bytes())?;
        }
        zip.finish()?;
    }
    Ok(buffer)
}

#[derive(Clone)]
pub struct TrainingService {
    db: DatabaseConnection,
    persons: PersonService,
    assets: AssetService,
    ledger: DerivationService,
    trainer: Option<Arc<dyn LoraTrainer>>,
    http: reqwest::Client,
    share_ttl: Duration,
    training_timeout: Duration,
}

impl TrainingService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: DatabaseConnection,
        persons: PersonService,
        assets: AssetService,
        ledger: DerivationService,
        trainer: Option<Arc<dyn LoraTrainer>>,
        http: reqwest::Client,
        share_ttl: Duration,
        training_timeout: Duration,
    ) -> Self {
        Self {
            db,
            persons,
            assets,
            ledger,
            trainer,
            http,
            share_ttl,
            training_timeout,
        }
    }

    pub async fn find(&self, id: Uuid) -> LedgerResult<Option<training_runs::Model>> {
        Ok(training_runs::Entity::find_by_id(id).one(&self.db).await?)
    }

    pub async fn get(&self, id: Uuid) -> LedgerResult<training_runs::Model> {
        self.find(id).await?.ok_or(LedgerError::TrainingRunNotFound(id))
    }

    pub async fn list_for_person(&self, person_id: i32) -> LedgerResult<Vec<training_runs::Model>> {
        Ok(training_runs::Entity::find()
            .filter(training_runs::Column::PersonId.eq(person_id))
            .order_by_desc(training_runs::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    /// Validate the request, record a pending run and carry it to completion.
    /// Request errors are returned; failures during the run end up on the row.
    #[instrument(skip(self, request), fields(person = request.person_id, images = request.image_asset_ids.len()))]
    pub async fn train(&self, request: TrainingRequest) -> LedgerResult<training_runs::Model> {
        let trainer = self
            .trainer
            .clone()
            .ok_or_else(|| TransformError::NotConfigured("LoRA trainer credentials are not set".to_string()))?;

        if request.image_asset_ids.is_empty() {
            return Err(LedgerError::Validation("Training needs at least one image".to_string()));
        }
        let person = self.persons.get(request.person_id).await?;
        let trigger_word = request
            .trigger_word
            .or(person.trigger_word.clone())
            .map(|word| word.trim().to_string())
            .filter(|word| !word.is_empty())
            .ok_or_else(|| {
                LedgerError::Validation(format!("Person {} has no trigger word and none was given", person.id))
            })?;

        let mut captioned = Vec::with_capacity(request.image_asset_ids.len());
        for asset_id in &request.image_asset_ids {
            let asset = self.assets.get(*asset_id).await?;
            let caption = self
                .ledger
                .latest_complete(asset.id, Operation::Caption)
                .await?
                .and_then(|derivation| derivation.output_text)
                .ok_or_else(|| LedgerError::Validation(format!("Asset {} has no completed caption", asset.id)))?;
            captioned.push((asset, caption));
        }

        let now = Utc::now();
        let run = training_runs::ActiveModel {
            id: Set(Uuid::new_v4()),
            person_id: Set(person.id),
            trigger_word: Set(trigger_word.clone()),
            status: Set(TrainingStatus::Pending.into()),
            image_count: Set(captioned.len() as i32),
            service: Set(trainer.service().to_string()),
            model: Set(trainer.model().to_string()),
            bundle_asset_id: Set(None),
            weights_asset_id: Set(None),
            config_asset_id: Set(None),
            failure_reason: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            completed_at: Set(None),
        }
        .insert(&self.db)
        .await?;
        info!("Started training run {} for person {}", run.id, person.id);

        match self.execute(&run, trainer.as_ref(), captioned).await {
            Ok(()) => {
                let mut active: training_runs::ActiveModel = self.get(run.id).await?.into();
                let now = Utc::now();
                active.status = Set(TrainingStatus::Complete.into());
                active.updated_at = Set(now);
                active.completed_at = Set(Some(now));
                let completed = active.update(&self.db).await?;
                info!("Training run {} complete", completed.id);
                Ok(completed)
            }
            Err(err) => {
                warn!("Training run {} failed: {}", run.id, err);
                let mut active: training_runs::ActiveModel = self.get(run.id).await?.into();
                let now = Utc::now();
                active.status = Set(TrainingStatus::Failed.into());
                active.failure_reason = Set(Some(err.to_string()));
                active.updated_at = Set(now);
                active.completed_at = Set(Some(now));
                Ok(active.update(&self.db).await?)
            }
        }
    }

    async fn execute(
        &self,
        run: &training_runs::Model,
        trainer: &dyn LoraTrainer,
        captioned: Vec<(assets::Model, String)>,
    ) -> LedgerResult<()> {
        let store = self.assets.store();

        let mut entries = Vec::with_capacity(captioned.len());
        for (asset, caption) in captioned {
            entries.push(BundleEntry {
                image: store.get(&asset).await?,
                content_type: asset.content_type,
                caption,
            });
        }
        let bundle = tokio::task::spawn_blocking(move || build_bundle(&entries))
            .await
            .map_err(|err| StorageError::Unavailable(format!("bundle task failed: {}", err)))?
            .map_err(|err| StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))?;

        let bundle_asset = self
            .store_and_record(run.person_id, Bytes::from(bundle), "application/zip")
            .await?;
        self.set_asset(run.id, training_runs::Column::BundleAssetId, bundle_asset.id)
            .await?;
        let bundle_url = store.signed_read_url(&bundle_asset, self.share_ttl).await?;

        let outputs = timeout(self.training_timeout, async {
            let outputs = trainer.train(&bundle_url, &run.trigger_word).await?;
            let weights = self.download(&outputs.weights, "application/octet-stream").await?;
            let config = self.download(&outputs.config, "application/json").await?;
            Ok::<_, TransformError>((weights, config))
        })
        .await
        .map_err(|_| LedgerError::Timeout(self.training_timeout))??;

        let ((weights, weights_type), (config, config_type)) = outputs;
        let weights_asset = self.store_and_record(run.person_id, weights, &weights_type).await?;
        self.set_asset(run.id, training_runs::Column::WeightsAssetId, weights_asset.id)
            .await?;
        let config_asset = self.store_and_record(run.person_id, config, &config_type).await?;
        self.set_asset(run.id, training_runs::Column::ConfigAssetId, config_asset.id)
            .await?;
        Ok(())
    }

    async fn download(&self, file: &RemoteFile, fallback_type: &str) -> Result<(Bytes, String), TransformError> {
        let fetched = fetch(&self.http, &file.url).await?;
        let content_type = file
            .content_type
            .clone()
            .or(fetched.content_type)
            .unwrap_or_else(|| fallback_type.to_string());
        Ok((fetched.bytes, content_type))
    }

    async fn store_and_record(&self, owner_id: i32, bytes: Bytes, content_type: &str) -> LedgerResult<assets::Model> {
        let asset = self.assets.store().put(owner_id, bytes, content_type).await?;
        Ok(record_asset(&self.db, &asset).await?)
    }

    async fn set_asset(&self, run_id: Uuid, column: training_runs::Column, asset_id: Uuid) -> LedgerResult<()> {
        training_runs::Entity::update_many()
            .col_expr(column, Expr::value(asset_id))
            .col_expr(training_runs::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(training_runs::Column::Id.eq(run_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn test_bundle_numbers_pairs() {
        let entries = vec![
            BundleEntry {
                content_type: "image/png".to_string(),
                image: Bytes::from_static(b"png-bytes"),
                caption: "first caption".to_string(),
            },
            BundleEntry {
                content_type: "image/jpeg".to_string(),
                image: Bytes::from_static(b"jpeg-bytes"),
                caption: "second caption".to_string(),
            },
        ];

        let bytes = build_bundle(&entries).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["001.png", "001.txt", "002.jpg", "002.txt"]);

        let mut caption = String::new();
        archive.by_name("002.txt").unwrap().read_to_string(&mut caption).unwrap();
        assert_eq!(caption, "second caption");
    }

    #[test]
    fn test_request_accepts_snake_and_camel_case() {
        let camel: TrainingRequest =
            serde_json::from_str(r#"{"personId": 3, "trigger": "ZXY", "imageAssetIds": []}"#).unwrap();
        assert_eq!(camel.person_id, 3);
        assert_eq!(camel.trigger_word.as_deref(), Some("ZXY"));

        let snake: TrainingRequest = serde_json::from_str(r#"{"person_id": 3, "image_asset_ids": []}"#).unwrap();
        assert_eq!(snake.trigger_word, None);
    }
}
