//! Speech-to-text
//!
//! Segments are transcribed in one batch call per capture. The HTTP variant
//! speaks the OpenAI-compatible `/v1/audio/transcriptions` API that
//! whisper servers expose.

use super::audio::{duration_ms, encode_wav};
use crate::config::SttSettings;
use crate::engine::remote::error_body;
use crate::engine::{Device, Lifecycle, RemoteModel};
use crate::{ParleyError, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait Transcriber: Lifecycle {
    /// Transcribe a complete mono segment. Returns trimmed text, possibly empty.
    async fn transcribe(&self, samples: &[i16], sample_rate: u32) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

pub struct WhisperClient {
    remote: RemoteModel,
}

impl WhisperClient {
    pub fn new(settings: &SttSettings) -> Result<Self> {
        Ok(Self {
            remote: RemoteModel::new(
                &settings.base_url,
                &settings.model,
                &settings.device,
                settings.memory_estimate_mb,
                Duration::from_secs(120),
            )?,
        })
    }
}

#[async_trait]
impl Lifecycle for WhisperClient {
    fn name(&self) -> String {
        format!("whisper:{}", self.remote.model())
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
impl Transcriber for WhisperClient {
    async fn transcribe(&self, samples: &[i16], sample_rate: u32) -> Result<String> {
        let wav = encode_wav(samples, sample_rate)
            .map_err(|e| ParleyError::TranscriptionError(e.to_string()))?;
        debug!(
            "Transcribing {} ms of audio ({} bytes WAV)",
            duration_ms(samples.len(), sample_rate),
            wav.len()
        );

        let part = Part::bytes(wav)
            .file_name("segment.wav")
            .mime_str("audio/wav")
            .map_err(|e| ParleyError::TranscriptionError(e.to_string()))?;
        let form = Form::new()
            .part("file", part)
            .text("model", self.remote.model().to_string())
            .text("response_format", "json");

        let response = self
            .remote
            .http()
            .post(self.remote.url("/v1/audio/transcriptions"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ParleyError::TranscriptionError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ParleyError::TranscriptionError(error_body(response).await));
        }

        let body: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| ParleyError::TranscriptionError(format!("Invalid response: {}", e)))?;

        Ok(body.text.trim().to_string())
    }
}
