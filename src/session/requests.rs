//! Engine calls made for client settings
//!
//! Switching the TTS engine or listing its voices can take as long as an
//! engine load. These run on a per-session worker, one at a time in arrival
//! order, so the read loop stays free to handle an interrupt.

use super::events::{Outbound, ServerEvent};
use crate::engine::EngineManager;
use crate::speech::Synthesizer;
use crate::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The voice picked by the client. None uses the engine default.
pub type VoiceChoice = Arc<Mutex<Option<String>>>;

#[derive(Debug)]
pub enum SettingsRequest {
    SwitchTts(String),
    SetVoice(String),
    ListVoices,
}

pub struct SettingsWorker {
    pub engines: Arc<EngineManager>,
    pub outbound: Outbound,
    pub voice: VoiceChoice,
}

impl SettingsWorker {
    pub async fn run(
        self,
        mut requests: mpsc::UnboundedReceiver<SettingsRequest>,
        cancel: CancellationToken,
    ) {
        loop {
            let request = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = requests.recv() => request,
            };
            let Some(request) = request else {
                break;
            };
            debug!("Settings request: {:?}", request);
            self.handle(request).await;
        }
    }

    async fn handle(&self, request: SettingsRequest) {
        match request {
            SettingsRequest::SwitchTts(engine) => match self.engines.switch_tts(&engine).await {
                Ok(name) => {
                    // Voices belong to an engine
                    *self.voice.lock() = None;
                    self.send(ServerEvent::TtsEngineChanged { tts_engine: name });
                }
                Err(e) => {
                    warn!("TTS engine switch failed: {}", e);
                    self.send(ServerEvent::error(e.to_string()));
                }
            },
            SettingsRequest::SetVoice(voice) => match tts_voices(&self.engines).await {
                Ok((voices, _)) if voices.contains(&voice) => {
                    info!("Voice set to {}", voice);
                    *self.voice.lock() = Some(voice.clone());
                    self.send(ServerEvent::ack("voice", voice));
                }
                Ok(_) => self.send(ServerEvent::error("Voice not found")),
                Err(e) => {
                    warn!("Could not list voices: {}", e);
                    self.send(ServerEvent::error(e.to_string()));
                }
            },
            SettingsRequest::ListVoices => match tts_voices(&self.engines).await {
                Ok((voices, default_voice)) => {
                    let current = self.voice.lock().clone().unwrap_or(default_voice);
                    self.send(ServerEvent::AvailableVoices { voices, current });
                }
                Err(e) => {
                    warn!("Could not list voices: {}", e);
                    self.send(ServerEvent::error(e.to_string()));
                }
            },
        }
    }

    fn send(&self, event: ServerEvent) {
        if let Err(e) = self.outbound.send(&event) {
            debug!("Dropping settings event: {}", e);
        }
    }
}

/// Voices of the active TTS engine and its default voice
async fn tts_voices(engines: &EngineManager) -> Result<(Vec<String>, String)> {
    let engine = engines.tts().engine()?;
    let voices = engine.voices().await?;
    Ok((voices, engine.default_voice()))
}
