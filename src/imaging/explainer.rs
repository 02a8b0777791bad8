//! Describes user-attached images through an OpenAI-compatible vision model

use super::{encode_base64, to_png};
use crate::config::ImageExplainerSettings;
use crate::engine::remote::error_body;
use crate::engine::{Device, Lifecycle, RemoteModel};
use crate::{ParleyError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_EXPLAIN_PROMPT: &str = "Describe this image in detail.";

#[async_trait]
pub trait ImageExplainer: Lifecycle {
    /// Describe `image` (any format the image crate reads) in plain text
    async fn explain(&self, image: &[u8], prompt: &str) -> Result<String>;
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct HttpImageExplainer {
    remote: RemoteModel,
    max_tokens: u32,
}

impl HttpImageExplainer {
    pub fn new(settings: &ImageExplainerSettings) -> Result<Self> {
        Ok(Self {
            remote: RemoteModel::new(
                &settings.base_url,
                &settings.model,
                &settings.device,
                settings.memory_estimate_mb,
                Duration::from_secs(180),
            )?,
            max_tokens: settings.max_tokens,
        })
    }
}

#[async_trait]
impl Lifecycle for HttpImageExplainer {
    fn name(&self) -> String {
        self.remote.model().to_string()
    }

    fn device(&self) -> Device {
        self.remote.device()
    }

    async fn load(&self) -> Result<u64> {
        self.remote.load().await
    }

    async fn unload(&self) -> Result<()> {
        self.remote.unload().await
    }
}

#[async_trait]
impl ImageExplainer for HttpImageExplainer {
    async fn explain(&self, image: &[u8], prompt: &str) -> Result<String> {
        let png = to_png(image).map_err(|e| ParleyError::ImageExplanationError(e.to_string()))?;
        let prompt = if prompt.trim().is_empty() {
            DEFAULT_EXPLAIN_PROMPT
        } else {
            prompt
        };
        debug!("Explaining {} byte image", png.len());

        let payload = json!({
            "model": self.remote.model(),
            "max_tokens": self.max_tokens,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    {
                        "type": "image_url",
                        "image_url": { "url": format!("data:image/png;base64,{}", encode_base64(&png)) }
                    }
                ]
            }]
        });

        let response = self
            .remote
            .http()
            .post(self.remote.url("/v1/chat/completions"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ParleyError::ImageExplanationError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ParleyError::ImageExplanationError(error_body(response).await));
        }

        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|e| ParleyError::ImageExplanationError(format!("Invalid response: {}", e)))?;

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        if text.is_empty() {
            return Err(ParleyError::ImageExplanationError(
                "Explainer returned an empty description".into(),
            ));
        }
        Ok(text)
    }
}
