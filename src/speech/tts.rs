//! Text-to-speech
//!
//! The HTTP variant posts to `/v1/audio/speech` asking for raw PCM and reads the
//! native rate from `X-Sample-Rate`. Audio is resampled to the server's output
//! rate so every chunk of a session shares one `audio_start` sample rate.

use super::audio::{pcm16le_to_i16, resample_i16};
use crate::config::TtsVariant;
use crate::engine::remote::error_body;
use crate::engine::{Device, Lifecycle, RemoteModel};
use crate::{ParleyError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Synthesized speech for one text chunk
#[derive(Clone, Debug, Default)]
pub struct SpeechAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl SpeechAudio {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[async_trait]
pub trait Synthesizer: Lifecycle {
    /// Synthesize one chunk. `voice` falls back to the engine's default.
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<SpeechAudio>;

    async fn voices(&self) -> Result<Vec<String>>;

    fn default_voice(&self) -> String;
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
}

#[derive(Deserialize)]
struct VoicesResponse {
    voices: Vec<VoiceEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VoiceEntry {
    Name(String),
    Detailed { id: String },
}

pub struct HttpSynthesizer {
    remote: RemoteModel,
    variant: String,
    default_voice: String,
    native_rate: u32,
    output_rate: u32,
}

impl HttpSynthesizer {
    pub fn new(variant: &TtsVariant, output_rate: u32) -> Result<Self> {
        Ok(Self {
            remote: RemoteModel::new(
                &variant.base_url,
                &variant.model,
                &variant.device,
                variant.memory_estimate_mb,
                Duration::from_secs(60),
            )?,
            variant: variant.name.clone(),
            default_voice: variant.default_voice.clone(),
            native_rate: variant.sample_rate,
            output_rate,
        })
    }
}

#[async_trait]
impl Lifecycle for HttpSynthesizer {
    fn name(&self) -> String {
        format!("{}:{}", self.variant, self.remote.model())
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
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<SpeechAudio> {
        let voice = voice.unwrap_or(&self.default_voice);
        let request = SpeechRequest {
            model: self.remote.model(),
            input: text,
            voice,
            response_format: "pcm",
        };

        let response = self
            .remote
            .http()
            .post(self.remote.url("/v1/audio/speech"))
            .json(&request)
            .send()
            .await
            .map_err(|e| ParleyError::SynthesisError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ParleyError::SynthesisError(error_body(response).await));
        }

        let native_rate = response
            .headers()
            .get("x-sample-rate")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(self.native_rate);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ParleyError::SynthesisError(e.to_string()))?;
        let samples = pcm16le_to_i16(&bytes);
        debug!("Synthesized {} samples at {} Hz for {:?}", samples.len(), native_rate, text);

        let samples = resample_i16(&samples, native_rate, self.output_rate)
            .map_err(|e| ParleyError::SynthesisError(e.to_string()))?;

        Ok(SpeechAudio {
            samples,
            sample_rate: self.output_rate,
        })
    }

    async fn voices(&self) -> Result<Vec<String>> {
        let response = self
            .remote
            .http()
            .get(self.remote.url("/v1/audio/voices"))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ParleyError::SynthesisError(error_body(response).await));
        }

        let body: VoicesResponse = response.json().await?;
        Ok(body
            .voices
            .into_iter()
            .map(|v| match v {
                VoiceEntry::Name(name) => name,
                VoiceEntry::Detailed { id } => id,
            })
            .collect())
    }

    fn default_voice(&self) -> String {
        self.default_voice.clone()
    }
}

/// Clean up reply text before synthesis: drop markdown emphasis, expand a few
/// abbreviations the voices read badly and collapse whitespace.
pub fn normalize_text_for_tts(text: &str) -> String {
    let mut result = text.replace(['*', '_', '`', '#'], "");

    let abbreviations = [
        ("Mr.", "Mister"),
        ("Mrs.", "Misses"),
        ("Dr.", "Doctor"),
        ("Prof.", "Professor"),
        ("vs.", "versus"),
        ("etc.", "etcetera"),
        ("e.g.", "for example"),
        ("i.e.", "that is"),
    ];
    for (abbrev, expansion) in abbreviations {
        result = result.replace(abbrev, expansion);
    }

    result = result.replace('&', " and ");
    result = result.replace('%', " percent");

    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text_for_tts("**Hello**   there"), "Hello there");
        assert_eq!(normalize_text_for_tts("Dr. Smith & co"), "Doctor Smith and co");
        assert_eq!(normalize_text_for_tts("50% off"), "50 percent off");
        assert_eq!(normalize_text_for_tts("   "), "");
    }

    #[test]
    fn test_voice_list_shapes() {
        let plain: VoicesResponse = serde_json::from_str(r#"{"voices": ["a", "b"]}"#).unwrap();
        assert_eq!(plain.voices.len(), 2);

        let body = r#"{"voices": [{"id": "en_GB-jenny", "language": "en"}]}"#;
        let detailed: VoicesResponse = serde_json::from_str(body).unwrap();
        assert!(matches!(&detailed.voices[0], VoiceEntry::Detailed { id } if id == "en_GB-jenny"));
    }

    #[test]
    fn test_synthesizer_name() {
        let synth = HttpSynthesizer::new(&TtsVariant::default(), 22050).unwrap();
        assert_eq!(synth.name(), "piper:piper");
        assert_eq!(synth.default_voice(), "en_GB-jenny_dioco-medium");
        assert_eq!(synth.device(), Device::Cpu);
    }
}
