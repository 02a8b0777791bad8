//! Engine lifecycle management
//!
//! Every generative engine (speech recognition, chat, speech synthesis, image
//! generation, image explanation) implements [`Lifecycle`] and is held in an
//! [`EngineSlot`] owned by the [`EngineManager`].

mod manager;
pub mod remote;

pub use manager::{EngineLease, EngineManager, EngineSet, EngineSlot, EngineStatus, ReleasePolicy};
pub use remote::RemoteModel;

use crate::{ParleyError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The five engine slots a session can draw on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Stt,
    Tts,
    Llm,
    ImageGenerator,
    ImageExplainer,
}

impl EngineKind {
    pub const ALL: [EngineKind; 5] = [
        EngineKind::Stt,
        EngineKind::Tts,
        EngineKind::Llm,
        EngineKind::ImageGenerator,
        EngineKind::ImageExplainer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Stt => "stt",
            EngineKind::Tts => "tts",
            EngineKind::Llm => "llm",
            EngineKind::ImageGenerator => "image_generator",
            EngineKind::ImageExplainer => "image_explainer",
        }
    }

    /// Whether the low-resource policy unloads this kind after every use.
    ///
    /// STT, TTS and the chat model sit on the interactive path and stay loaded.
    pub fn unloads_under_low_resource(&self) -> bool {
        matches!(self, EngineKind::ImageGenerator | EngineKind::ImageExplainer)
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = ParleyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "stt" => Ok(EngineKind::Stt),
            "tts" => Ok(EngineKind::Tts),
            "llm" => Ok(EngineKind::Llm),
            "image_generator" | "imagegen" => Ok(EngineKind::ImageGenerator),
            "image_explainer" | "imageexplainer" => Ok(EngineKind::ImageExplainer),
            other => Err(ParleyError::ProtocolError(format!("Unknown engine kind: {}", other))),
        }
    }
}

/// Where an engine's weights live
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Accelerator,
    Cpu,
    Remote,
}

impl Device {
    /// Resolve a configured device name against the service location.
    ///
    /// A service on another host is always `Remote`, whatever it was configured with.
    pub fn resolve(device: &str, base_url: &str) -> Device {
        if !is_local_url(base_url) {
            return Device::Remote;
        }
        match device.to_ascii_lowercase().as_str() {
            "cpu" => Device::Cpu,
            _ => Device::Accelerator,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Accelerator => write!(f, "accelerator"),
            Device::Cpu => write!(f, "cpu"),
            Device::Remote => write!(f, "remote"),
        }
    }
}

/// True when the URL points at this machine
pub fn is_local_url(url: &str) -> bool {
    match reqwest::Url::parse(url) {
        Ok(parsed) => matches!(
            parsed.host_str(),
            Some("localhost" | "127.0.0.1" | "0.0.0.0" | "::1" | "[::1]")
        ),
        Err(_) => false,
    }
}

/// Load/unload contract shared by every engine variant
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Human readable engine name, e.g. the model id
    fn name(&self) -> String;

    fn device(&self) -> Device;

    /// Bring the engine up. Returns the memory footprint estimate in MB.
    async fn load(&self) -> Result<u64>;

    async fn unload(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip_names() {
        for kind in EngineKind::ALL {
            assert_eq!(kind.as_str().parse::<EngineKind>().unwrap(), kind);
        }
        assert_eq!("imagegen".parse::<EngineKind>().unwrap(), EngineKind::ImageGenerator);
        assert!("vocoder".parse::<EngineKind>().is_err());
    }

    #[test]
    fn test_low_resource_exemptions() {
        assert!(!EngineKind::Stt.unloads_under_low_resource());
        assert!(!EngineKind::Tts.unloads_under_low_resource());
        assert!(!EngineKind::Llm.unloads_under_low_resource());
        assert!(EngineKind::ImageGenerator.unloads_under_low_resource());
        assert!(EngineKind::ImageExplainer.unloads_under_low_resource());
    }

    #[test]
    fn test_device_resolution() {
        assert!(is_local_url("http://localhost:11434"));
        assert!(is_local_url("http://[::1]:8000"));
        assert!(!is_local_url("https://ollama.example.com"));
        assert!(!is_local_url("not a url"));

        assert_eq!(Device::resolve("cuda", "http://127.0.0.1:8030"), Device::Accelerator);
        assert_eq!(Device::resolve("cpu", "http://localhost:8020"), Device::Cpu);
        assert_eq!(Device::resolve("cuda", "http://gpu-box:8030"), Device::Remote);
    }
}
