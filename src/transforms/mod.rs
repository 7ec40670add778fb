//! Transform collaborators.
//!
//! A [`Transform`] turns one source asset into either new bytes, a URL the
//! pipeline downloads, or text. Transforms never touch the ledger; the
//! pipeline records whatever they return.

pub mod background;
pub mod caption;
pub mod http;
pub mod image_ops;
pub mod training;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::derivation::{Operation, OperationParameters};
use crate::errors::{LedgerError, LedgerResult, TransformError, TransformResult};

pub use background::{BackgroundRemovalTransform, FalBackgroundRemover, ReplicateBackgroundRemover};
pub use caption::{AnthropicCaptioner, CaptionTransform, Captioner};
pub use image_ops::{CropTransform, RotateTransform};
pub use training::{FalLoraTrainer, LoraTrainer, RemoteFile, TrainingOutputs};

/// How a transform wants to receive its source asset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Bytes,
    Url,
}

#[derive(Debug, Clone)]
pub struct TransformInput {
    pub asset_id: Uuid,
    pub owner_id: i32,
    pub content_type: String,
    pub bytes: Option<Bytes>,
    pub url: Option<String>,
}

impl TransformInput {
    pub fn bytes(&self) -> TransformResult<&Bytes> {
        self.bytes.as_ref().ok_or_else(|| {
            TransformError::InvalidInput(format!("asset {} was not provided as bytes", self.asset_id))
        })
    }

    pub fn url(&self) -> TransformResult<&str> {
        self.url.as_deref().ok_or_else(|| {
            TransformError::InvalidInput(format!("asset {} was not provided as a URL", self.asset_id))
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutput {
    Binary { bytes: Bytes, content_type: String },
    /// Result hosted elsewhere; downloaded by the pipeline before it is stored
    RemoteUrl { url: String, content_type: Option<String> },
    Text(String),
}

#[async_trait]
pub trait Transform: Send + Sync {
    fn operation(&self) -> Operation;

    fn input_kind(&self, _parameters: &OperationParameters) -> InputKind {
        InputKind::Bytes
    }

    async fn apply(
        &self,
        input: TransformInput,
        parameters: &OperationParameters,
    ) -> TransformResult<TransformOutput>;
}

/// Transforms by operation, built once at startup
#[derive(Clone, Default)]
pub struct TransformRegistry {
    transforms: HashMap<Operation, Arc<dyn Transform>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, transform: Arc<dyn Transform>) -> &mut Self {
        self.transforms.insert(transform.operation(), transform);
        self
    }

    pub fn with(mut self, transform: Arc<dyn Transform>) -> Self {
        self.register(transform);
        self
    }

    pub fn get(&self, operation: Operation) -> LedgerResult<Arc<dyn Transform>> {
        self.transforms.get(&operation).cloned().ok_or_else(|| {
            LedgerError::Validation(format!("No transform registered for '{}'", operation))
        })
    }

    pub fn operations(&self) -> Vec<Operation> {
        let mut operations: Vec<Operation> = self.transforms.keys().copied().collect();
        operations.sort_by_key(|op| op.as_str());
        operations
    }
}
