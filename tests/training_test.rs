mod common;

use std::io::{Cursor, Read};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;

use common::{create_person, fast_options, setup_with, upload_png, InlineTrainer, TestLedger};
use derivation_ledger::database::entities::{assets, persons};
use derivation_ledger::derivation::Operation;
use derivation_ledger::errors::{LedgerError, TransformError, TransformResult};
use derivation_ledger::services::TrainingRequest;
use derivation_ledger::transforms::{CaptionTransform, Captioner, LoraTrainer, TrainingOutputs, TransformRegistry};

struct CoatCaptioner;

#[async_trait]
impl Captioner for CoatCaptioner {
    async fn describe(&self, _image: &[u8], _media_type: &str, _prompt: &str, _model: &str) -> TransformResult<String> {
        Ok("wearing a red coat".to_string())
    }
}

struct RejectingTrainer;

#[async_trait]
impl LoraTrainer for RejectingTrainer {
    fn service(&self) -> &str {
        "rejecting"
    }

    fn model(&self) -> &str {
        "rejecting-lora"
    }

    async fn train(&self, _bundle_url: &str, _trigger_word: &str) -> TransformResult<TrainingOutputs> {
        Err(TransformError::service("rejecting", "queue is full"))
    }
}

async fn setup_training(trainer: Arc<dyn LoraTrainer>) -> TestLedger {
    setup_with(TransformRegistry::new(), Some(trainer)).await
}

async fn caption(ledger: &TestLedger, person: &persons::Model, source: &assets::Model) {
    let transform = CaptionTransform::new(Arc::new(CoatCaptioner), ledger.ctx.persons().clone(), String::new());
    let parameters = ledger
        .ctx
        .parameters(Operation::Caption, serde_json::json!({ "personId": person.id }))
        .await
        .unwrap();
    let outcome = ledger
        .ctx
        .pipeline()
        .derive(source, parameters, &transform, &fast_options())
        .await
        .unwrap();
    assert!(outcome.derivation.is_complete());
}

#[tokio::test]
async fn test_training_run_stores_bundle_and_outputs() {
    let trainer = Arc::new(InlineTrainer::new());
    let ledger = setup_training(trainer.clone()).await;
    let person = create_person(&ledger.ctx).await;
    let first = upload_png(&ledger.ctx, person.id, 4, 4).await;
    let second = upload_png(&ledger.ctx, person.id, 5, 5).await;
    caption(&ledger, &person, &first).await;
    caption(&ledger, &person, &second).await;

    let run = ledger
        .ctx
        .training()
        .train(TrainingRequest {
            person_id: person.id,
            trigger_word: None,
            image_asset_ids: vec![first.id, second.id],
        })
        .await
        .unwrap();

    assert_eq!(run.status, "complete", "{:?}", run.failure_reason);
    assert_eq!(run.trigger_word, "ZXY");
    assert_eq!(run.image_count, 2);
    assert_eq!(run.service, "inline");
    assert!(run.completed_at.is_some());
    assert_eq!(trainer.calls.load(Ordering::SeqCst), 1);

    let bundle = ledger.ctx.assets().read(run.bundle_asset_id.unwrap()).await.unwrap();
    let mut archive = zip::ZipArchive::new(Cursor::new(bundle.to_vec())).unwrap();
    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();
    assert_eq!(names, vec!["001.png", "001.txt", "002.png", "002.txt"]);
    let mut text = String::new();
    archive.by_name("001.txt").unwrap().read_to_string(&mut text).unwrap();
    assert_eq!(text, "ZXY, a asian, 30 year old, female. wearing a red coat");

    let weights = ledger.ctx.assets().read(run.weights_asset_id.unwrap()).await.unwrap();
    assert_eq!(&weights[..], b"weights");
    let config = ledger.ctx.assets().get(run.config_asset_id.unwrap()).await.unwrap();
    assert_eq!(config.content_type, "application/json");
    assert_eq!(config.owner_id, person.id);

    let stored = ledger.ctx.training().get(run.id).await.unwrap();
    assert_eq!(stored.id, run.id);
    assert_eq!(stored.weights_asset_id, run.weights_asset_id);
    assert_eq!(ledger.ctx.training().list_for_person(person.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_training_requires_captions() {
    let trainer = Arc::new(InlineTrainer::new());
    let ledger = setup_training(trainer.clone()).await;
    let person = create_person(&ledger.ctx).await;
    let uncaptioned = upload_png(&ledger.ctx, person.id, 4, 4).await;

    let err = ledger
        .ctx
        .training()
        .train(TrainingRequest {
            person_id: person.id,
            trigger_word: Some("ZXY".to_string()),
            image_asset_ids: vec![uncaptioned.id],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));

    let err = ledger
        .ctx
        .training()
        .train(TrainingRequest {
            person_id: person.id,
            trigger_word: None,
            image_asset_ids: vec![],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));

    assert_eq!(trainer.calls.load(Ordering::SeqCst), 0);
    assert!(ledger.ctx.training().list_for_person(person.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_trainer_failures_are_recorded_on_the_run() {
    let ledger = setup_training(Arc::new(RejectingTrainer)).await;
    let person = create_person(&ledger.ctx).await;
    let image = upload_png(&ledger.ctx, person.id, 4, 4).await;
    caption(&ledger, &person, &image).await;

    let run = ledger
        .ctx
        .training()
        .train(TrainingRequest {
            person_id: person.id,
            trigger_word: None,
            image_asset_ids: vec![image.id],
        })
        .await
        .unwrap();

    assert_eq!(run.status, "failed");
    assert!(run.failure_reason.unwrap().contains("queue is full"));
    assert!(run.bundle_asset_id.is_some());
    assert!(run.weights_asset_id.is_none());
}
