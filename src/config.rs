//! Server configuration
//!
//! Defaults are layered with an optional TOML file, environment overrides and
//! finally command line flags (applied by `main`).

use crate::{ParleyError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Top-level configuration for the server process
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Unload memory-hungry engines after every use
    pub low_resource_mode: bool,

    /// Upper bound on a single engine load, in seconds
    pub engine_load_timeout_secs: u64,

    /// Where character portraits are stored
    pub data_dir: PathBuf,

    /// Sample rate of inbound PCM16LE audio frames
    pub input_sample_rate: u32,

    /// Sample rate of outbound speech audio
    pub output_sample_rate: u32,

    /// Captures shorter than this are never transcribed
    pub min_capture_ms: u32,

    pub llm: LlmSettings,
    pub stt: SttSettings,
    pub tts: TtsSettings,
    pub image_generator: ImageGeneratorSettings,
    pub image_explainer: ImageExplainerSettings,
    pub vad: VadSettings,
    pub chunking: ChunkingSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            low_resource_mode: true,
            engine_load_timeout_secs: 120,
            data_dir: default_data_dir(),
            input_sample_rate: 16000,
            output_sample_rate: 22050,
            min_capture_ms: 100,
            llm: LlmSettings::default(),
            stt: SttSettings::default(),
            tts: TtsSettings::default(),
            image_generator: ImageGeneratorSettings::default(),
            image_explainer: ImageExplainerSettings::default(),
            vad: VadSettings::default(),
            chunking: ChunkingSettings::default(),
        }
    }
}

/// Chat model service
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub host: String,
    pub model: String,
    /// Ollama `keep_alive` used when warming the model
    pub keep_alive: String,
    pub memory_estimate_mb: u64,
    /// Condense `[IMAGE: ...]` directives with the chat model before generation
    pub optimize_image_prompts: bool,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            model: "glm-4.7:cloud".to_string(),
            keep_alive: "30m".to_string(),
            memory_estimate_mb: 6000,
            optimize_image_prompts: true,
        }
    }
}

/// Speech-to-text service
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SttSettings {
    pub base_url: String,
    pub model: String,
    pub device: String,
    pub memory_estimate_mb: u64,
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8010".to_string(),
            model: "medium.en".to_string(),
            device: "auto".to_string(),
            memory_estimate_mb: 1500,
        }
    }
}

/// One selectable text-to-speech engine
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsVariant {
    pub name: String,
    pub base_url: String,
    pub model: String,
    pub default_voice: String,
    pub device: String,
    /// Used when the service omits `X-Sample-Rate`
    pub sample_rate: u32,
    pub memory_estimate_mb: u64,
}

impl Default for TtsVariant {
    fn default() -> Self {
        Self {
            name: "piper".to_string(),
            base_url: "http://localhost:8020".to_string(),
            model: "piper".to_string(),
            default_voice: "en_GB-jenny_dioco-medium".to_string(),
            device: "cpu".to_string(),
            sample_rate: 22050,
            memory_estimate_mb: 100,
        }
    }
}

/// Text-to-speech engines
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsSettings {
    pub default_engine: String,
    pub engines: Vec<TtsVariant>,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            default_engine: "piper".to_string(),
            engines: vec![TtsVariant::default()],
        }
    }
}

impl TtsSettings {
    pub fn variant(&self, name: &str) -> Option<&TtsVariant> {
        self.engines
            .iter()
            .find(|v| v.name.eq_ignore_ascii_case(name))
    }
}

/// Image generation service
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageGeneratorSettings {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance: f32,
    pub memory_estimate_mb: u64,
}

impl Default for ImageGeneratorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:8030".to_string(),
            model: "stable-diffusion".to_string(),
            device: "auto".to_string(),
            width: 768,
            height: 512,
            steps: 30,
            guidance: 7.5,
            memory_estimate_mb: 8000,
        }
    }
}

/// Image explanation (vision) service
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageExplainerSettings {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub device: String,
    pub max_tokens: u32,
    pub memory_estimate_mb: u64,
}

impl Default for ImageExplainerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:8040".to_string(),
            model: "vision".to_string(),
            device: "auto".to_string(),
            max_tokens: 256,
            memory_estimate_mb: 4000,
        }
    }
}

/// Which speech detector drives call-mode segmentation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadDetector {
    Energy,
    Silero,
}

/// Voice activity segmentation thresholds for call mode
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VadSettings {
    pub detector: VadDetector,
    /// RMS level for the energy detector, speech probability for Silero
    pub threshold: f32,
    pub min_speech_ms: u32,
    pub silence_ms: u32,
    pub max_utterance_ms: u32,
    pub pre_roll_ms: u32,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            detector: VadDetector::Energy,
            threshold: 0.02,
            min_speech_ms: 300,
            silence_ms: 900,
            max_utterance_ms: 20_000,
            pre_roll_ms: 160,
        }
    }
}

/// Reply chunking for speech synthesis
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    /// Cut an unterminated phrase once it reaches this many words
    pub max_words: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self { max_words: 18 }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("parley"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

/// Default location of the config file, if the platform has a config dir
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("parley").join("config.toml"))
}

impl ServerConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from a TOML file; missing keys keep their defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ParleyError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&content)
            .map_err(|e| ParleyError::ConfigError(format!("{}: {}", path.display(), e)))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ParleyError::ConfigError(e.to_string()))
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a key lookup (the environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("PARLEY_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("PARLEY_PORT") {
            self.port = port
                .parse()
                .map_err(|_| ParleyError::ConfigError(format!("Invalid PARLEY_PORT: {}", port)))?;
        }
        if let Some(flag) = lookup("LOW_VRAM_MODE") {
            self.low_resource_mode = parse_flag(&flag).ok_or_else(|| {
                ParleyError::ConfigError(format!("Invalid LOW_VRAM_MODE: {}", flag))
            })?;
        }
        if let Some(host) = lookup("LLM_HOST") {
            self.llm.host = host;
        }
        if let Some(model) = lookup("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(url) = lookup("STT_URL") {
            self.stt.base_url = url;
        }
        if let Some(url) = lookup("TTS_URL") {
            for variant in &mut self.tts.engines {
                variant.base_url = url.clone();
            }
        }
        if let Some(url) = lookup("IMAGEGEN_URL") {
            self.image_generator.base_url = url;
        }
        if let Some(url) = lookup("IMAGEEXPLAINER_URL") {
            self.image_explainer.base_url = url;
        }
        if let Some(dir) = lookup("DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        debug!("Configuration after overrides: {:?}", self);
        Ok(())
    }

    pub fn with_low_resource_mode(mut self, enabled: bool) -> Self {
        self.low_resource_mode = enabled;
        self
    }

    pub fn with_engine_load_timeout(mut self, timeout: Duration) -> Self {
        self.engine_load_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_llm_model(mut self, model: impl Into<String>) -> Self {
        self.llm.model = model.into();
        self
    }

    pub fn engine_load_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_load_timeout_secs)
    }

    pub fn characters_dir(&self) -> PathBuf {
        self.data_dir.join("characters")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.input_sample_rate == 0 || self.output_sample_rate == 0 {
            return Err(ParleyError::ConfigError(
                "Sample rates must be greater than 0".into(),
            ));
        }
        if self.engine_load_timeout_secs == 0 {
            return Err(ParleyError::ConfigError(
                "Engine load timeout must be greater than 0".into(),
            ));
        }
        if self.tts.engines.is_empty() {
            return Err(ParleyError::ConfigError(
                "At least one TTS engine must be configured".into(),
            ));
        }
        if self.tts.variant(&self.tts.default_engine).is_none() {
            return Err(ParleyError::ConfigError(format!(
                "Default TTS engine '{}' is not configured",
                self.tts.default_engine
            )));
        }
        if !(0.0..=1.0).contains(&self.vad.threshold) {
            return Err(ParleyError::ConfigError(format!(
                "VAD threshold must be within 0.0..=1.0, got {}",
                self.vad.threshold
            )));
        }
        if self.vad.silence_ms == 0 || self.vad.max_utterance_ms <= self.vad.min_speech_ms {
            return Err(ParleyError::ConfigError(
                "VAD silence must be positive and max utterance longer than min speech".into(),
            ));
        }
        if self.chunking.max_words == 0 {
            return Err(ParleyError::ConfigError(
                "Chunking word limit must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
