//! Text-to-image generation
//!
//! The HTTP variant uses the OpenAI-style `/v1/images/generations` API with
//! `response_format: "b64_json"`.

use super::{decode_base64_image, encode_base64, to_png};
use crate::config::ImageGeneratorSettings;
use crate::engine::remote::error_body;
use crate::engine::{Device, Lifecycle, RemoteModel};
use crate::{ParleyError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageRequest {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance: f32,
}

impl ImageRequest {
    /// Request sized by the configured defaults
    pub fn from_settings(prompt: impl Into<String>, settings: &ImageGeneratorSettings) -> Self {
        Self {
            prompt: prompt.into(),
            width: settings.width,
            height: settings.height,
            steps: settings.steps,
            guidance: settings.guidance,
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

/// A finished image, always PNG
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    #[serde(with = "png_base64")]
    pub png: Vec<u8>,
    pub prompt: String,
}

impl GeneratedImage {
    pub fn to_base64(&self) -> String {
        encode_base64(&self.png)
    }
}

mod png_base64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::encode_base64(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::decode_base64_image(&text).map_err(serde::de::Error::custom)
    }
}

#[async_trait]
pub trait ImageGenerator: Lifecycle {
    async fn generate(&self, request: &ImageRequest) -> Result<GeneratedImage>;
}

#[derive(Serialize)]
struct GenerationPayload<'a> {
    model: &'a str,
    prompt: &'a str,
    size: String,
    steps: u32,
    guidance_scale: f32,
    n: u32,
    response_format: &'static str,
}

#[derive(Deserialize)]
struct GenerationResponse {
    data: Vec<GenerationData>,
}

#[derive(Deserialize)]
struct GenerationData {
    b64_json: String,
}

pub struct HttpImageGenerator {
    remote: RemoteModel,
}

impl HttpImageGenerator {
    pub fn new(settings: &ImageGeneratorSettings) -> Result<Self> {
        Ok(Self {
            remote: RemoteModel::new(
                &settings.base_url,
                &settings.model,
                &settings.device,
                settings.memory_estimate_mb,
                Duration::from_secs(300),
            )?,
        })
    }
}

#[async_trait]
impl Lifecycle for HttpImageGenerator {
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
impl ImageGenerator for HttpImageGenerator {
    async fn generate(&self, request: &ImageRequest) -> Result<GeneratedImage> {
        info!(
            "Generating {}x{} image ({} steps): {}",
            request.width, request.height, request.steps, request.prompt
        );

        let payload = GenerationPayload {
            model: self.remote.model(),
            prompt: &request.prompt,
            size: format!("{}x{}", request.width, request.height),
            steps: request.steps,
            guidance_scale: request.guidance,
            n: 1,
            response_format: "b64_json",
        };

        let response = self
            .remote
            .http()
            .post(self.remote.url("/v1/images/generations"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ParleyError::ImageGenerationError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ParleyError::ImageGenerationError(error_body(response).await));
        }

        let body: GenerationResponse = response
            .json()
            .await
            .map_err(|e| ParleyError::ImageGenerationError(format!("Invalid response: {}", e)))?;
        let first = body
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ParleyError::ImageGenerationError("No image returned".into()))?;

        let bytes = decode_base64_image(&first.b64_json)
            .map_err(|e| ParleyError::ImageGenerationError(e.to_string()))?;
        let png = to_png(&bytes).map_err(|e| ParleyError::ImageGenerationError(e.to_string()))?;

        Ok(GeneratedImage {
            png,
            prompt: request.prompt.clone(),
        })
    }
}
