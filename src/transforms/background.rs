//! Background removal through hosted providers.
//!
//! Fal is called synchronously with a signed URL to the source; Replicate
//! takes the image inline and is polled until the prediction settles.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::http::{read_json, to_data_uri};
use super::{InputKind, Transform, TransformInput, TransformOutput};
use crate::derivation::{BackgroundProvider, Operation, OperationParameters};
use crate::errors::{TransformError, TransformResult};
use crate::poll::{poll_with_backoff, PollError, PollPolicy, PollState};

pub const FAL_REMBG_ENDPOINT: &str = "https://fal.run/fal-ai/imageutils/rembg";
pub const REPLICATE_API_BASE: &str = "https://api.replicate.com/v1";
pub const REPLICATE_REMBG_VERSION: &str =
    "fb8af171cfa1616ddcf1242c093f9c46bcada5ad4cf6f2fbe8b81b330ec5c003";

pub struct FalBackgroundRemover {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct FalImage {
    url: String,
    content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FalRembgResponse {
    image: FalImage,
}

impl FalBackgroundRemover {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            endpoint: FAL_REMBG_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub async fn remove(&self, image_url: &str) -> TransformResult<TransformOutput> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::AUTHORIZATION, format!("Key {}", self.api_key))
            .json(&json!({ "image_url": image_url, "sync_mode": true }))
            .send()
            .await?;

        let body = read_json("fal", response).await?;
        let parsed: FalRembgResponse = serde_json::from_value(body)
            .map_err(|err| TransformError::malformed("fal", format!("expected image.url: {}", err)))?;

        debug!("fal rembg returned {}", truncate(&parsed.image.url));
        Ok(TransformOutput::RemoteUrl {
            url: parsed.image.url,
            content_type: parsed.image.content_type,
        })
    }
}

pub struct ReplicateBackgroundRemover {
    client: reqwest::Client,
    token: String,
    base_url: String,
    version: String,
    poll: PollPolicy,
}

#[derive(Debug, Clone, Deserialize)]
struct Prediction {
    id: String,
    status: String,
    #[serde(default)]
    output: Value,
    #[serde(default)]
    error: Value,
}

impl ReplicateBackgroundRemover {
    pub fn new(client: reqwest::Client, token: impl Into<String>, poll: PollPolicy) -> Self {
        Self {
            client,
            token: token.into(),
            base_url: REPLICATE_API_BASE.to_string(),
            version: REPLICATE_REMBG_VERSION.to_string(),
            poll,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn get_prediction(&self, id: &str) -> TransformResult<Prediction> {
        let response = self
            .client
            .get(format!("{}/predictions/{}", self.base_url, id))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let body = read_json("replicate", response).await?;
        serde_json::from_value(body).map_err(|err| TransformError::malformed("replicate", err.to_string()))
    }

    pub async fn remove(&self, content_type: &str, bytes: &[u8]) -> TransformResult<TransformOutput> {
        let response = self
            .client
            .post(format!("{}/predictions", self.base_url))
            .bearer_auth(&self.token)
            .json(&json!({
                "version": self.version,
                "input": { "image": to_data_uri(content_type, bytes) },
            }))
            .send()
            .await?;
        let body = read_json("replicate", response).await?;
        let created: Prediction =
            serde_json::from_value(body).map_err(|err| TransformError::malformed("replicate", err.to_string()))?;
        info!("Replicate prediction {} created", created.id);

        let job_id = created.id.clone();
        let settled = poll_with_backoff(&self.poll, |attempt| {
            let job_id = job_id.clone();
            let first = (attempt == 1).then(|| created.clone());
            async move {
                let prediction = match first {
                    Some(prediction) => prediction,
                    None => self.get_prediction(&job_id).await?,
                };
                match prediction.status.as_str() {
                    "succeeded" => Ok(PollState::Ready(prediction)),
                    "failed" | "canceled" => Err(TransformError::JobFailed {
                        service: "replicate".to_string(),
                        job_id: prediction.id.clone(),
                        reason: error_text(&prediction.error, &prediction.status),
                    }),
                    _ => Ok(PollState::Pending),
                }
            }
        })
        .await
        .map_err(|err| match err {
            PollError::Failed(err) => err,
            exhausted @ PollError::Exhausted { .. } => TransformError::PollExhausted {
                service: "replicate".to_string(),
                job_id: job_id.clone(),
                reason: exhausted.to_string(),
            },
        })?;

        let url = prediction_output_url(&settled.output).ok_or_else(|| {
            TransformError::malformed("replicate", "prediction succeeded without an output URL")
        })?;
        Ok(TransformOutput::RemoteUrl { url, content_type: None })
    }
}

fn error_text(error: &Value, status: &str) -> String {
    match error {
        Value::String(message) => message.clone(),
        Value::Null => format!("prediction {}", status),
        other => other.to_string(),
    }
}

/// Output is either a single URL or a list whose first entry is the image
fn prediction_output_url(output: &Value) -> Option<String> {
    match output {
        Value::String(url) => Some(url.clone()),
        Value::Array(items) => items.first().and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn truncate(url: &str) -> &str {
    match url.char_indices().nth(80) {
        Some((index, _)) => &url[..index],
        None => url,
    }
}

/// Dispatches `remove_background` to the provider named in the parameters
#[derive(Default)]
pub struct BackgroundRemovalTransform {
    fal: Option<Arc<FalBackgroundRemover>>,
    replicate: Option<Arc<ReplicateBackgroundRemover>>,
}

impl BackgroundRemovalTransform {
    pub fn new(
        fal: Option<Arc<FalBackgroundRemover>>,
        replicate: Option<Arc<ReplicateBackgroundRemover>>,
    ) -> Self {
        Self { fal, replicate }
    }

    fn provider(parameters: &OperationParameters) -> TransformResult<BackgroundProvider> {
        match parameters {
            OperationParameters::RemoveBackground(removal) => Ok(removal.provider),
            _ => Err(TransformError::InvalidInput(
                "expected remove_background parameters".to_string(),
            )),
        }
    }
}

#[async_trait]
impl Transform for BackgroundRemovalTransform {
    fn operation(&self) -> Operation {
        Operation::RemoveBackground
    }

    fn input_kind(&self, parameters: &OperationParameters) -> InputKind {
        match Self::provider(parameters) {
            Ok(BackgroundProvider::Replicate) => InputKind::Bytes,
            _ => InputKind::Url,
        }
    }

    async fn apply(
        &self,
        input: TransformInput,
        parameters: &OperationParameters,
    ) -> TransformResult<TransformOutput> {
        match Self::provider(parameters)? {
            BackgroundProvider::Fal => {
                let fal = self
                    .fal
                    .as_ref()
                    .ok_or_else(|| TransformError::NotConfigured("fal (FAL_KEY)".to_string()))?;
                fal.remove(input.url()?).await
            }
            BackgroundProvider::Replicate => {
                let replicate = self.replicate.as_ref().ok_or_else(|| {
                    TransformError::NotConfigured("replicate (REPLICATE_API_TOKEN)".to_string())
                })?;
                replicate.remove(&input.content_type, input.bytes()?).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivation::BackgroundRemoval;

    #[test]
    fn test_prediction_output_shapes() {
        assert_eq!(
            prediction_output_url(&json!("https://r/out.png")).as_deref(),
            Some("https://r/out.png")
        );
        assert_eq!(
            prediction_output_url(&json!(["https://r/a.png", "https://r/b.png"])).as_deref(),
            Some("https://r/a.png")
        );
        assert_eq!(prediction_output_url(&Value::Null), None);
    }

    #[test]
    fn test_input_kind_follows_provider() {
        let transform = BackgroundRemovalTransform::default();
        let fal = OperationParameters::RemoveBackground(BackgroundRemoval {
            provider: BackgroundProvider::Fal,
        });
        let replicate = OperationParameters::RemoveBackground(BackgroundRemoval {
            provider: BackgroundProvider::Replicate,
        });
        assert_eq!(transform.input_kind(&fal), InputKind::Url);
        assert_eq!(transform.input_kind(&replicate), InputKind::Bytes);
    }

    #[tokio::test]
    async fn test_unconfigured_provider() {
        let transform = BackgroundRemovalTransform::default();
        let input = TransformInput {
            asset_id: uuid::Uuid::nil(),
            owner_id: 1,
            content_type: "image/png".to_string(),
            bytes: None,
            url: Some("https://store/a.png".to_string()),
        };
        let parameters = OperationParameters::RemoveBackground(BackgroundRemoval::default());
        let err = transform.apply(input, &parameters).await.unwrap_err();
        assert!(matches!(err, TransformError::NotConfigured(_)));
    }
}
