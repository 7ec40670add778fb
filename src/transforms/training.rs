//! LoRA training collaborator: a queued remote job that reads a zip bundle
//! from a signed URL and produces weight and config files.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::http::read_json;
use crate::errors::{TransformError, TransformResult};
use crate::poll::{poll_with_backoff, PollError, PollPolicy, PollState};

pub const FAL_QUEUE_BASE: &str = "https://queue.fal.run";
pub const FAL_LORA_MODEL: &str = "fal-ai/flux-lora-fast-training";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteFile {
    pub url: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOutputs {
    pub weights: RemoteFile,
    pub config: RemoteFile,
}

#[async_trait]
pub trait LoraTrainer: Send + Sync {
    fn service(&self) -> &str;

    fn model(&self) -> &str;

    async fn train(&self, bundle_url: &str, trigger_word: &str) -> TransformResult<TrainingOutputs>;
}

pub struct FalLoraTrainer {
    client: reqwest::Client,
    api_key: String,
    queue_base: String,
    model_path: String,
    poll: PollPolicy,
}

#[derive(Debug, Deserialize)]
struct QueueSubmission {
    request_id: String,
    #[serde(default)]
    status_url: Option<String>,
    #[serde(default)]
    response_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueueStatus {
    status: String,
}

#[derive(Debug, Deserialize)]
struct LoraResult {
    diffusers_lora_file: RemoteFile,
    config_file: RemoteFile,
}

impl FalLoraTrainer {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, poll: PollPolicy) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            queue_base: FAL_QUEUE_BASE.to_string(),
            model_path: FAL_LORA_MODEL.to_string(),
            poll,
        }
    }

    pub fn with_queue_base(mut self, queue_base: impl Into<String>) -> Self {
        self.queue_base = queue_base.into();
        self
    }

    fn auth(&self) -> String {
        format!("Key {}", self.api_key)
    }

    fn requests_url(&self, request_id: &str) -> String {
        format!("{}/{}/requests/{}", self.queue_base, self.model_path, request_id)
    }

    async fn check_status(&self, status_url: &str, request_id: &str) -> TransformResult<PollState<()>> {
        let response = self
            .client
            .get(status_url)
            .header(reqwest::header::AUTHORIZATION, self.auth())
            .send()
            .await?;
        let body = read_json("fal", response).await?;
        let status: QueueStatus =
            serde_json::from_value(body).map_err(|err| TransformError::malformed("fal", err.to_string()))?;

        debug!("fal training request {} is {}", request_id, status.status);
        match status.status.as_str() {
            "COMPLETED" => Ok(PollState::Ready(())),
            "IN_QUEUE" | "IN_PROGRESS" => Ok(PollState::Pending),
            other => Err(TransformError::JobFailed {
                service: "fal".to_string(),
                job_id: request_id.to_string(),
                reason: format!("unexpected queue status {}", other),
            }),
        }
    }
}

#[async_trait]
impl LoraTrainer for FalLoraTrainer {
    fn service(&self) -> &str {
        "fal.ai"
    }

    fn model(&self) -> &str {
        &self.model_path
    }

    async fn train(&self, bundle_url: &str, trigger_word: &str) -> TransformResult<TrainingOutputs> {
        let response = self
            .client
            .post(format!("{}/{}", self.queue_base, self.model_path))
            .header(reqwest::header::AUTHORIZATION, self.auth())
            .json(&json!({
                "images_data_url": bundle_url,
                "trigger_word": trigger_word,
                "is_input_format_already_preprocessed": true,
            }))
            .send()
            .await?;
        let body = read_json("fal", response).await?;
        let submission: QueueSubmission =
            serde_json::from_value(body).map_err(|err| TransformError::malformed("fal", err.to_string()))?;
        info!("fal training request {} queued", submission.request_id);

        let request_id = submission.request_id.clone();
        let status_url = submission
            .status_url
            .unwrap_or_else(|| format!("{}/status", self.requests_url(&request_id)));
        let response_url = submission
            .response_url
            .unwrap_or_else(|| self.requests_url(&request_id));

        let (status_url_ref, request_id_ref) = (status_url.as_str(), request_id.as_str());
        poll_with_backoff(&self.poll, move |_| self.check_status(status_url_ref, request_id_ref))
            .await
            .map_err(|err| match err {
                PollError::Failed(err) => err,
                exhausted @ PollError::Exhausted { .. } => TransformError::PollExhausted {
                    service: "fal".to_string(),
                    job_id: request_id.clone(),
                    reason: exhausted.to_string(),
                },
            })?;

        let response = self
            .client
            .get(&response_url)
            .header(reqwest::header::AUTHORIZATION, self.auth())
            .send()
            .await?;
        let body = read_json("fal", response).await?;
        let result: LoraResult = serde_json::from_value(body).map_err(|err| {
            TransformError::malformed("fal", format!("expected diffusers_lora_file and config_file: {}", err))
        })?;

        Ok(TrainingOutputs {
            weights: result.diffusers_lora_file,
            config: result.config_file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_shape() {
        let body = json!({
            "diffusers_lora_file": {
                "url": "https://fal.media/files/lora.safetensors",
                "file_name": "pytorch_lora_weights.safetensors",
                "content_type": "application/octet-stream"
            },
            "config_file": { "url": "https://fal.media/files/config.json" }
        });
        let result: LoraResult = serde_json::from_value(body).unwrap();
        assert_eq!(
            result.diffusers_lora_file.file_name.as_deref(),
            Some("pytorch_lora_weights.safetensors")
        );
        assert_eq!(result.config_file.content_type, None);
    }

    #[test]
    fn test_default_queue_urls() {
        let trainer = FalLoraTrainer::new(reqwest::Client::new(), "key", PollPolicy::default());
        assert_eq!(
            trainer.requests_url("abc"),
            "https://queue.fal.run/fal-ai/flux-lora-fast-training/requests/abc"
        );
        assert_eq!(trainer.service(), "fal.ai");
    }
}
