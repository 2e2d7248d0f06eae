use std::sync::Arc;

use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{
    config::GenerationSettings,
    error::GenerationError,
    retry::{retry_with_policy, RetryPolicy, Sleeper, TokioSleeper},
    types::{GeneratedImage, ReferenceImage},
};

const ERROR_BODY_PREVIEW_CHARS: usize = 512;

/// Which generation capability a request goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationTarget {
    TextToImage,
    ImageToImage,
}

impl GenerationTarget {
    pub fn for_reference(reference: Option<&ReferenceImage>) -> Self {
        if reference.is_some() {
            GenerationTarget::ImageToImage
        } else {
            GenerationTarget::TextToImage
        }
    }
}

pub struct ImageClient {
    http: Client,
    api_key: Option<String>,
    settings: GenerationSettings,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl ImageClient {
    pub fn new(
        api_key: Option<String>,
        settings: GenerationSettings,
        retry: RetryPolicy,
    ) -> Result<Self, GenerationError> {
        let http = Client::builder()
            .timeout(settings.request_timeout())
            .build()?;
        Ok(Self {
            http,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            settings,
            retry,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn endpoint(&self, target: GenerationTarget) -> String {
        let base = self.settings.api_base.trim_end_matches('/');
        match target {
            GenerationTarget::TextToImage => {
                format!("{base}/models/{}:predict", self.settings.text_model)
            }
            GenerationTarget::ImageToImage => {
                format!("{base}/models/{}:generateContent", self.settings.image_model)
            }
        }
    }

    /// Generates one image, retrying transport and payload failures on the
    /// configured schedule. Nothing is persisted on failure.
    pub async fn generate(
        &self,
        prompt: &str,
        reference: Option<&ReferenceImage>,
    ) -> Result<GeneratedImage, GenerationError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(GenerationError::MissingApiKey);
        };
        let target = GenerationTarget::for_reference(reference);
        let endpoint = self.endpoint(target);
        let payload = match reference {
            Some(reference) => image_to_image_payload(prompt, reference),
            None => text_to_image_payload(prompt, self.settings.sample_count.max(1)),
        };

        info!(?target, prompt_chars = prompt.chars().count(), "generation: request");
        let result = retry_with_policy(
            &self.retry,
            self.sleeper.as_ref(),
            "generation",
            GenerationError::is_retryable,
            |attempt| {
                debug!(?target, attempt, "generation: attempt");
                self.attempt(&endpoint, api_key, &payload, target)
            },
        )
        .await;

        match result {
            Ok(image) => Ok(image),
            Err(exhausted) if exhausted.attempts == 1 && !exhausted.last.is_retryable() => {
                Err(exhausted.last)
            }
            Err(exhausted) => Err(GenerationError::Exhausted {
                attempts: exhausted.attempts,
                last: Box::new(exhausted.last),
            }),
        }
    }

    async fn attempt(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &Value,
        target: GenerationTarget,
    ) -> Result<GeneratedImage, GenerationError> {
        let response = self
            .http
            .post(endpoint)
            .query(&[("key", api_key)])
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body: truncate_text(&body, ERROR_BODY_PREVIEW_CHARS),
            });
        }

        let parsed: Value =
            serde_json::from_str(&body).map_err(|err| GenerationError::Decode(err.to_string()))?;
        match target {
            GenerationTarget::TextToImage => extract_prediction_image(&parsed),
            GenerationTarget::ImageToImage => extract_inline_image(&parsed),
        }
    }
}

fn text_to_image_payload(prompt: &str, sample_count: u32) -> Value {
    json!({
        "instances": [{ "prompt": prompt }],
        "parameters": { "sampleCount": sample_count },
    })
}

fn image_to_image_payload(prompt: &str, reference: &ReferenceImage) -> Value {
    json!({
        "contents": [{
            "parts": [
                { "text": prompt },
                {
                    "inlineData": {
                        "mimeType": reference.mime_type,
                        "data": reference.data_b64,
                    }
                },
            ]
        }],
        "generationConfig": { "responseModalities": ["TEXT", "IMAGE"] },
    })
}

fn extract_prediction_image(payload: &Value) -> Result<GeneratedImage, GenerationError> {
    let prediction = payload
        .get("predictions")
        .and_then(Value::as_array)
        .and_then(|predictions| predictions.first())
        .ok_or(GenerationError::MissingImage)?;
    let data = prediction
        .get("bytesBase64Encoded")
        .and_then(Value::as_str)
        .filter(|data| !data.is_empty())
        .ok_or(GenerationError::MissingImage)?;
    let mime_type = prediction.get("mimeType").and_then(Value::as_str);
    Ok(GeneratedImage::from_base64(mime_type, data))
}

fn extract_inline_image(payload: &Value) -> Result<GeneratedImage, GenerationError> {
    let candidates = payload
        .get("candidates")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for part in parts {
            let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data")) else {
                continue;
            };
            let data = inline
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str);
            return Ok(GeneratedImage::from_base64(mime_type, data));
        }
    }

    Err(GenerationError::MissingImage)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
#[path = "tests/generation_tests.rs"]
mod tests;
