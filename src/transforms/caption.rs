//! Captioning: a black-box vision model describes the image, then the
//! description is prefixed with the person's metadata locally.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::http::read_json;
use super::{Transform, TransformInput, TransformOutput};
use crate::database::entities::persons;
use crate::derivation::{Operation, OperationParameters};
use crate::errors::{TransformError, TransformResult};
use crate::services::PersonService;

pub const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const CAPTION_MAX_TOKENS: u32 = 300;

pub const DEFAULT_CAPTION_PROMPT: &str = "Describe the person in this image in detail. Focus on their physical appearance, clothing, and any notable features. Do not mention the background or setting. Be concise and factual.";

const SUPPORTED_MEDIA_TYPES: [&str; 4] = ["image/jpeg", "image/png", "image/gif", "image/webp"];

/// Read the caption prompt, falling back to [`DEFAULT_CAPTION_PROMPT`]
pub fn load_caption_prompt(path: Option<&Path>) -> String {
    let Some(path) = path else {
        return DEFAULT_CAPTION_PROMPT.to_string();
    };
    match std::fs::read_to_string(path) {
        Ok(prompt) if !prompt.trim().is_empty() => prompt,
        Ok(_) => {
            warn!("Caption prompt file {} is empty, using default prompt", path.display());
            DEFAULT_CAPTION_PROMPT.to_string()
        }
        Err(err) => {
            warn!(
                "Could not read caption prompt {}: {}, using default prompt",
                path.display(),
                err
            );
            DEFAULT_CAPTION_PROMPT.to_string()
        }
    }
}

/// Person metadata that prefixes every caption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionSubject {
    pub trigger: String,
    pub ethnicity: String,
    pub age: i32,
    pub gender: String,
}

impl CaptionSubject {
    pub fn from_person(person: &persons::Model, today: NaiveDate) -> TransformResult<Self> {
        let age = person.age_on(today).ok_or_else(|| {
            TransformError::MissingMetadata(format!(
                "person {} has neither a birthdate nor an age",
                person.id
            ))
        })?;
        if person.ethnicity.trim().is_empty() || person.gender.trim().is_empty() {
            return Err(TransformError::MissingMetadata(format!(
                "person {} is missing ethnicity or gender",
                person.id
            )));
        }
        Ok(Self {
            trigger: person.trigger().to_string(),
            ethnicity: person.ethnicity.clone(),
            age,
            gender: person.gender.clone(),
        })
    }
}

/// `"{trigger}, a {ethnicity}, {age} year old, {gender}."`
pub fn caption_prefix(subject: &CaptionSubject) -> String {
    format!(
        "{}, a {}, {} year old, {}.",
        subject.trigger, subject.ethnicity, subject.age, subject.gender
    )
}

/// `"{trigger}, a {ethnicity}, {age} year old, {gender}. {generated}"`
pub fn format_caption(subject: &CaptionSubject, generated: &str) -> String {
    format!("{} {}", caption_prefix(subject), generated)
}

#[async_trait]
pub trait Captioner: Send + Sync {
    /// Describe the image; the returned text is used verbatim
    async fn describe(
        &self,
        image: &[u8],
        media_type: &str,
        prompt: &str,
        model: &str,
    ) -> TransformResult<String>;
}

pub struct AnthropicCaptioner {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

impl AnthropicCaptioner {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: ANTHROPIC_API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl Captioner for AnthropicCaptioner {
    async fn describe(
        &self,
        image: &[u8],
        media_type: &str,
        prompt: &str,
        model: &str,
    ) -> TransformResult<String> {
        if !SUPPORTED_MEDIA_TYPES.contains(&media_type) {
            return Err(TransformError::UnsupportedFormat(format!(
                "captioning does not accept {}",
                media_type
            )));
        }

        let request = json!({
            "model": model,
            "max_tokens": CAPTION_MAX_TOKENS,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": media_type,
                            "data": STANDARD.encode(image),
                        }
                    },
                    { "type": "text", "text": prompt }
                ]
            }]
        });

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;

        let body = read_json("anthropic", response).await?;
        let parsed: MessagesResponse = serde_json::from_value(body)
            .map_err(|err| TransformError::malformed("anthropic", err.to_string()))?;

        match parsed.content.into_iter().next() {
            Some(ContentBlock { kind, text: Some(text) }) if kind == "text" => Ok(text),
            _ => Err(TransformError::malformed(
                "anthropic",
                "first content block is not text",
            )),
        }
    }
}

pub struct CaptionTransform {
    captioner: Arc<dyn Captioner>,
    persons: PersonService,
    prompt: String,
}

impl CaptionTransform {
    pub fn new(captioner: Arc<dyn Captioner>, persons: PersonService, prompt: String) -> Self {
        Self {
            captioner,
            persons,
            prompt,
        }
    }
}

#[async_trait]
impl Transform for CaptionTransform {
    fn operation(&self) -> Operation {
        Operation::Caption
    }

    async fn apply(
        &self,
        input: TransformInput,
        parameters: &OperationParameters,
    ) -> TransformResult<TransformOutput> {
        let OperationParameters::Caption(request) = parameters else {
            return Err(TransformError::InvalidInput("expected caption parameters".to_string()));
        };

        // Resolve metadata before paying for the model call
        let person = self
            .persons
            .find(request.person_id)
            .await
            .map_err(|err| TransformError::service("persons", err.to_string()))?
            .ok_or_else(|| {
                TransformError::MissingMetadata(format!("person {} not found", request.person_id))
            })?;
        let subject = CaptionSubject::from_person(&person, Utc::now().date_naive())?;

        let generated = self
            .captioner
            .describe(input.bytes()?, &input.content_type, &self.prompt, &request.model)
            .await?;
        debug!("Caption generated for asset {} with {}", input.asset_id, request.model);

        Ok(TransformOutput::Text(format_caption(&subject, &generated)))
    }
}
