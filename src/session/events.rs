//! Wire protocol and the gated outbound emitter
//!
//! Inbound JSON control messages are [`ClientMessage`]; outbound JSON events
//! are [`ServerEvent`]. Audio travels as raw PCM16LE binary frames, bracketed
//! by `audio_start` / `audio_end`.

use super::context::HistoryEntry;
use super::settings::OutputMode;
use super::turn::TurnState;
use crate::imaging::CharacterType;
use crate::speech::audio::i16_to_pcm16le;
use crate::speech::SpeechAudio;
use crate::{ParleyError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(alias = "begin_capture")]
    UserAudioStart,
    #[serde(alias = "end_capture")]
    UserAudioEnd,
    TextMessage {
        #[serde(default)]
        text: String,
        /// Base64 or data URL
        #[serde(default)]
        image: Option<String>,
    },
    ResendLast,
    Interrupt,
    StopAudio,
    ClearChat,
    SyncHistory {
        #[serde(default)]
        history: Vec<HistoryEntry>,
    },
    EditMessage {
        index: usize,
        content: String,
    },
    DeleteMessage {
        index: usize,
    },
    Rewind {
        index: usize,
    },
    SetLlmModel {
        model: String,
    },
    SetLlmHost {
        host: String,
    },
    SetTtsEngine {
        engine: String,
    },
    SetVoice {
        voice: String,
    },
    GetAvailableVoices,
    SetOutputMode {
        mode: OutputMode,
    },
    SetContextMode {
        #[serde(default = "enabled")]
        enabled: bool,
    },
    SetImagegenMode {
        #[serde(default = "enabled")]
        enabled: bool,
    },
    SetSystemPrompt {
        #[serde(alias = "prompt")]
        content: String,
    },
    SetCharacterImage {
        character_type: CharacterType,
        #[serde(default, alias = "image")]
        image_path: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
    SetCallMode {
        #[serde(default = "enabled")]
        enabled: bool,
    },
}

fn enabled() -> bool {
    true
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| ParleyError::ProtocolError(format!("Invalid message: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Config {
        session_id: Uuid,
        tts_engine: String,
        llm_model: String,
        output_mode: OutputMode,
        image_generation: bool,
    },
    Ack {
        #[serde(flatten)]
        fields: Map<String, Value>,
    },
    AckRecording {
        recording: bool,
    },
    TurnState {
        state: TurnState,
    },
    SpeechStarted,
    SpeechEnded,
    Transcript {
        text: String,
    },
    ImageDescribed {
        description: String,
    },
    LlmPayload {
        payload: Value,
    },
    AssistantStart {
        message_id: Uuid,
    },
    AssistantDelta {
        delta: String,
    },
    AssistantEnd {
        message_id: Uuid,
        text: String,
    },
    AssistantCancelled {
        message_id: Uuid,
    },
    AudioStart {
        sample_rate: u32,
        format: String,
    },
    AudioEnd,
    AudioStopped,
    ImageGenerating {
        message_id: Uuid,
        prompt: String,
    },
    ImageGenerated {
        message_id: Uuid,
        image: String,
        prompt: String,
        format: String,
    },
    ImageError {
        message_id: Uuid,
        error: String,
        prompt: String,
    },
    Interrupted,
    ChatCleared,
    AvailableVoices {
        voices: Vec<String>,
        current: String,
    },
    TtsEngineChanged {
        tts_engine: String,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    /// `ack` with a single field
    pub fn ack(key: &str, value: impl Into<Value>) -> Self {
        let mut fields = Map::new();
        fields.insert(key.to_string(), value.into());
        ServerEvent::Ack { fields }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A frame ready for the transport
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Session-wide sender of outbound frames.
///
/// Turn output goes through a [`TurnEmitter`] and is only delivered while the
/// gate holds that turn's id. Closing the gate and sending happen under the
/// same lock, so once [`Outbound::close_turn`] returns no frame of the old
/// turn can follow.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<OutboundFrame>,
    gate: Arc<Mutex<Option<u64>>>,
}

impl Outbound {
    pub fn new(tx: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        Self {
            tx,
            gate: Arc::new(Mutex::new(None)),
        }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Send a session-level event, outside any turn
    pub fn send(&self, event: &ServerEvent) -> Result<()> {
        let _gate = self.gate.lock();
        self.push(event)
    }

    /// Raise `mute` and send `event` under the gate, so no audio group
    /// emitted through [`TurnEmitter::emit_audio_unless`] can follow the event.
    pub fn mute_and_send(&self, mute: Option<&AtomicBool>, event: &ServerEvent) -> Result<()> {
        let _gate = self.gate.lock();
        if let Some(mute) = mute {
            mute.store(true, Ordering::SeqCst);
        }
        self.push(event)
    }

    fn push(&self, event: &ServerEvent) -> Result<()> {
        self.tx
            .send(OutboundFrame::Text(event.to_json()?))
            .map_err(|_| ParleyError::ChannelError("Session transport closed".into()))
    }

    fn push_binary(&self, bytes: Vec<u8>) -> Result<()> {
        self.tx
            .send(OutboundFrame::Binary(bytes))
            .map_err(|_| ParleyError::ChannelError("Session transport closed".into()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Let `turn` emit
    pub fn open_turn(&self, turn: u64) -> TurnEmitter {
        *self.gate.lock() = Some(turn);
        TurnEmitter {
            outbound: self.clone(),
            turn,
        }
    }

    /// Stop the current turn's output
    pub fn close_turn(&self) -> Option<u64> {
        self.gate.lock().take()
    }

    /// Close the gate only if `turn` still holds it
    pub fn close_if(&self, turn: u64) -> bool {
        let mut gate = self.gate.lock();
        if *gate == Some(turn) {
            *gate = None;
            true
        } else {
            false
        }
    }

    pub fn active_turn(&self) -> Option<u64> {
        *self.gate.lock()
    }
}

/// Emitter bound to one turn. Sends return `false` once the turn is closed.
#[derive(Clone)]
pub struct TurnEmitter {
    outbound: Outbound,
    turn: u64,
}

impl TurnEmitter {
    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn is_open(&self) -> bool {
        *self.outbound.gate.lock() == Some(self.turn)
    }

    pub fn emit(&self, event: &ServerEvent) -> bool {
        let gate = self.outbound.gate.lock();
        if *gate != Some(self.turn) {
            return false;
        }
        self.outbound.push(event).is_ok()
    }

    /// Emit one synthesized chunk as `audio_start`, one binary frame, `audio_end`.
    /// The group is sent whole or not at all.
    pub fn emit_audio(&self, audio: &SpeechAudio) -> bool {
        let gate = self.outbound.gate.lock();
        if *gate != Some(self.turn) {
            return false;
        }
        self.push_audio(audio)
    }

    /// Like [`emit_audio`](Self::emit_audio), but drops the group when `mute`
    /// is raised. Returns false only when the turn is closed.
    pub fn emit_audio_unless(&self, audio: &SpeechAudio, mute: &AtomicBool) -> bool {
        let gate = self.outbound.gate.lock();
        if *gate != Some(self.turn) {
            return false;
        }
        mute.load(Ordering::SeqCst) || self.push_audio(audio)
    }

    fn push_audio(&self, audio: &SpeechAudio) -> bool {
        let start = ServerEvent::AudioStart {
            sample_rate: audio.sample_rate,
            format: "pcm16le".to_string(),
        };
        self.outbound.push(&start).is_ok()
            && self.outbound.push_binary(i16_to_pcm16le(&audio.samples)).is_ok()
            && self.outbound.push(&ServerEvent::AudioEnd).is_ok()
    }

    /// Send regardless of the gate. Used for events about the turn's own
    /// cancellation, which must still reach the client.
    pub fn emit_always(&self, event: &ServerEvent) -> bool {
        self.outbound.send(event).is_ok()
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }
}
