//! One live conversational session
//!
//! [`SessionController`] is the transport-agnostic half of the websocket
//! adapter: it consumes decoded control messages and audio frames, owns the
//! session settings and the single active turn, and answers through an
//! [`Outbound`] sender.

pub mod context;
pub mod events;
pub mod pipeline;
pub mod requests;
pub mod settings;
pub mod turn;

pub use context::{ContextStore, HistoryEntry, Message, MessageImage, Role, SharedContext};
pub use events::{ClientMessage, Outbound, OutboundFrame, ServerEvent, TurnEmitter};
pub use pipeline::{SessionHandles, TurnCoordinator, TurnInput, TurnOptions, TurnOutcome};
pub use settings::{CharacterIdentity, OutputMode, SessionSettings};
pub use turn::{SharedTurnState, TurnState, TurnStateMachine};

use crate::config::ServerConfig;
use crate::engine::EngineManager;
use crate::speech::audio::pcm16le_to_i16;
use crate::speech::{SegmentEvent, VadSegmenter};
use crate::utils::LatencyStats;
use crate::Result;
use parking_lot::Mutex;
use requests::{SettingsRequest, SettingsWorker, VoiceChoice};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// How long shutdown waits for background image work to hand its engines back
const BACKGROUND_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Audio collected between begin and end capture
#[derive(Default)]
struct Capture {
    samples: Vec<i16>,
    /// Sequence number of the last frame received
    frames: u64,
}

struct ActiveTurn {
    id: u64,
    cancel: CancellationToken,
    /// Set by `stop_audio`; silences the rest of this turn's speech
    mute: Arc<AtomicBool>,
    handle: JoinHandle<TurnOutcome>,
}

pub struct SessionController {
    /// Unique per connection
    id: Uuid,

    config: Arc<ServerConfig>,

    /// Shared with every turn this session starts
    handles: SessionHandles,

    /// Client-controlled configuration, copied into each new turn
    settings: SessionSettings,

    /// Kept outside `settings` since the settings worker updates it
    voice: VoiceChoice,

    /// Started with the first request that needs an engine
    settings_worker: Option<mpsc::UnboundedSender<SettingsRequest>>,

    /// Hold-to-talk or VAD capture in progress
    capture: Option<Capture>,

    active: Option<ActiveTurn>,
    next_turn: u64,

    /// Present while call mode is on
    segmenter: Option<VadSegmenter>,
}

impl SessionController {
    pub fn new(
        engines: Arc<EngineManager>,
        config: Arc<ServerConfig>,
        outbound: Outbound,
        latency: Arc<Mutex<LatencyStats>>,
    ) -> Self {
        let handles = SessionHandles {
            engines,
            context: ContextStore::shared(),
            machine: TurnStateMachine::shared(),
            outbound,
            session_cancel: CancellationToken::new(),
            background: TaskTracker::new(),
            options: Arc::new(TurnOptions::from_config(&config)),
            latency,
        };

        Self {
            id: Uuid::new_v4(),
            settings: SessionSettings::from_config(&config),
            config,
            handles,
            voice: VoiceChoice::default(),
            settings_worker: None,
            capture: None,
            active: None,
            next_turn: 0,
            segmenter: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn context(&self) -> &SharedContext {
        &self.handles.context
    }

    pub fn state(&self) -> TurnState {
        self.handles.machine.lock().state()
    }

    /// Announce the session to the client
    pub fn start(&self) -> Result<()> {
        info!("Session {} started", self.id);
        self.handles.outbound.send(&ServerEvent::Config {
            session_id: self.id,
            tts_engine: self.handles.engines.active_tts_engine(),
            llm_model: self.settings.llm_model.clone(),
            output_mode: self.settings.output_mode,
            image_generation: self.handles.engines.image_generation_available(),
        })
    }

    /// Handle one JSON control frame. Malformed input is answered with an
    /// `error` event and never ends the session.
    pub async fn handle_text(&mut self, text: &str) {
        match ClientMessage::parse(text) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                warn!("Rejected client message: {}", e);
                self.send(ServerEvent::error(e.to_string()));
            }
        }
    }

    pub async fn handle_message(&mut self, message: ClientMessage) {
        debug!("Client message: {}", message_kind(&message));
        match message {
            ClientMessage::UserAudioStart => self.begin_capture().await,
            ClientMessage::UserAudioEnd => self.end_capture().await,
            ClientMessage::TextMessage { text, image } => {
                let no_image = image.as_deref().map_or(true, |i| i.trim().is_empty());
                if text.trim().is_empty() && no_image {
                    debug!("Ignoring empty text message");
                    return;
                }
                self.start_turn(TurnInput::Text { text, image }).await;
            }
            ClientMessage::ResendLast => self.start_turn(TurnInput::Resend).await,
            ClientMessage::Interrupt => {
                if !self.barge_in().await {
                    debug!("Interrupt with nothing in flight");
                }
            }
            ClientMessage::StopAudio => self.stop_audio(),
            ClientMessage::ClearChat => {
                self.handles.context.lock().clear();
                info!("Chat cleared");
                self.send(ServerEvent::ChatCleared);
            }
            ClientMessage::SyncHistory { history } => {
                let count = history.len();
                self.handles.context.lock().replace_all(history);
                debug!("History synced ({} messages)", count);
                self.send(ServerEvent::ack("history_synced", count));
            }
            ClientMessage::EditMessage { index, content } => {
                let result = self.handles.context.lock().edit(index, content);
                self.reply_ack(result, "message_edited", index);
            }
            ClientMessage::DeleteMessage { index } => {
                let result = self.handles.context.lock().delete(index).map(|_| ());
                self.reply_ack(result, "message_deleted", index);
            }
            ClientMessage::Rewind { index } => {
                let result = self.handles.context.lock().rewind(index);
                self.reply_ack(result, "rewound_to", index);
            }
            ClientMessage::SetLlmModel { model } => {
                info!("LLM model set to {}", model);
                self.settings.llm_model = model.clone();
                self.send(ServerEvent::ack("llm_model", model));
            }
            ClientMessage::SetLlmHost { host } => {
                info!("LLM host set to {}", host);
                self.settings.llm_host = host.clone();
                self.send(ServerEvent::ack("llm_host", host));
            }
            ClientMessage::SetTtsEngine { engine } => {
                self.request_settings(SettingsRequest::SwitchTts(engine))
            }
            ClientMessage::SetVoice { voice } => {
                self.request_settings(SettingsRequest::SetVoice(voice))
            }
            ClientMessage::GetAvailableVoices => self.request_settings(SettingsRequest::ListVoices),
            ClientMessage::SetOutputMode { mode } => {
                self.settings.output_mode = mode;
                self.send(ServerEvent::ack("output_mode", mode.to_string()));
            }
            ClientMessage::SetContextMode { enabled } => {
                self.settings.use_context = enabled;
                self.send(ServerEvent::ack("use_context", enabled));
            }
            ClientMessage::SetImagegenMode { enabled } => {
                self.settings.include_imagegen = enabled;
                self.send(ServerEvent::ack("include_imagegen", enabled));
            }
            ClientMessage::SetSystemPrompt { content } => {
                self.settings.set_system_prompt(&content);
                debug!(
                    "System prompt updated (character description: {})",
                    self.settings.character_description.is_some()
                );
                self.send(ServerEvent::ack("system_prompt_updated", true));
            }
            ClientMessage::SetCharacterImage {
                character_type,
                image_path,
                name,
            } => {
                self.settings.set_character(character_type, name, image_path);
                self.send(ServerEvent::ack("character_image_set", character_type.as_str()));
            }
            ClientMessage::SetCallMode { enabled } => self.set_call_mode(enabled).await,
        }
    }

    /// Handle one binary frame of PCM16LE audio
    pub async fn handle_binary(&mut self, bytes: &[u8]) {
        if bytes.len() % 2 != 0 {
            debug!("Odd-sized audio frame ({} bytes), trailing byte dropped", bytes.len());
        }
        let samples = pcm16le_to_i16(bytes);

        if let Some(segmenter) = self.segmenter.as_mut() {
            let events = segmenter.push(&samples);
            for event in events {
                self.on_segment_event(event).await;
            }
            return;
        }

        match self.capture.as_mut() {
            Some(capture) => {
                capture.frames += 1;
                capture.samples.extend_from_slice(&samples);
            }
            None => debug!("Dropping {} samples received outside a capture", samples.len()),
        }
    }

    /// Tear down at disconnect: cancel everything in flight and wait for the
    /// engines to be handed back.
    pub async fn shutdown(mut self) {
        info!("Session {} closing", self.id);
        self.handles.outbound.close_turn();
        self.handles.session_cancel.cancel();
        self.settings_worker = None;

        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            if let Err(e) = active.handle.await {
                warn!("Turn {} ended abnormally: {}", active.id, e);
            }
        }

        self.handles.background.close();
        if tokio::time::timeout(BACKGROUND_DRAIN_TIMEOUT, self.handles.background.wait())
            .await
            .is_err()
        {
            warn!("Background image work still running at session close");
        }

        self.handles.machine.lock().reset();
    }

    async fn begin_capture(&mut self) {
        if self.capture.is_some() {
            debug!("Capture restarted");
            self.capture = Some(Capture::default());
        } else {
            self.barge_in().await;
            self.capture = Some(Capture::default());
            self.set_state(TurnState::CapturingUserAudio);
        }
        self.send(ServerEvent::AckRecording { recording: true });
    }

    async fn end_capture(&mut self) {
        self.send(ServerEvent::AckRecording { recording: false });
        let Some(capture) = self.capture.take() else {
            debug!("End of capture without a capture in progress");
            return;
        };
        debug!(
            "Capture ended: {} frame(s), {} samples",
            capture.frames,
            capture.samples.len()
        );
        self.start_turn(TurnInput::Audio {
            samples: capture.samples,
            sample_rate: self.config.input_sample_rate,
        })
        .await;
    }

    async fn on_segment_event(&mut self, event: SegmentEvent) {
        match event {
            SegmentEvent::SpeechStarted => {
                self.send(ServerEvent::SpeechStarted);
                self.barge_in().await;
                self.capture = Some(Capture::default());
                self.set_state(TurnState::CapturingUserAudio);
            }
            SegmentEvent::SegmentEnded { samples, reason } => {
                debug!("Speech segment ended ({:?})", reason);
                self.send(ServerEvent::SpeechEnded);
                self.capture = None;
                self.start_turn(TurnInput::Audio {
                    samples,
                    sample_rate: self.config.input_sample_rate,
                })
                .await;
            }
        }
    }

    async fn start_turn(&mut self, input: TurnInput) {
        if self.turn_in_flight() {
            self.barge_in().await;
        }
        // Typed input abandons a half-finished capture
        if !matches!(input, TurnInput::Audio { .. }) && self.capture.take().is_some() {
            debug!("Discarding capture in favour of typed input");
            self.set_state(TurnState::Idle);
        }

        self.next_turn += 1;
        let id = self.next_turn;
        let cancel = self.handles.session_cancel.child_token();
        let mute = Arc::new(AtomicBool::new(false));
        let emitter = self.handles.outbound.open_turn(id);

        let mut settings = self.settings.clone();
        settings.voice = self.voice.lock().clone();
        let coordinator = TurnCoordinator::new(
            self.handles.clone(),
            settings,
            emitter,
            cancel.clone(),
            mute.clone(),
        );
        let span = info_span!("turn", id);
        let handle = tokio::spawn(coordinator.run(input).instrument(span));

        self.active = Some(ActiveTurn {
            id,
            cancel,
            mute,
            handle,
        });
    }

    fn turn_in_flight(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.handle.is_finished())
    }

    /// Cancel whatever the session is doing and return to idle.
    ///
    /// The gate is closed before the turn is cancelled, so no frame of the old
    /// turn reaches the client once this starts, and `interrupted` is only sent
    /// after the turn task has finished its cleanup. Returns false when there
    /// was nothing to interrupt.
    async fn barge_in(&mut self) -> bool {
        let active = self.active.take().filter(|a| !a.handle.is_finished());
        if let Some(active) = active.as_ref() {
            self.handles.outbound.close_turn();
            active.cancel.cancel();
        }

        let interrupted = {
            let mut machine = self.handles.machine.lock();
            let changed = machine.interrupt();
            if changed {
                self.send(ServerEvent::TurnState {
                    state: TurnState::Interrupted,
                });
            }
            changed
        };

        if active.is_none() && !interrupted {
            return false;
        }

        if let Some(active) = active {
            info!("Barge-in: cancelling turn {}", active.id);
            match active.handle.await {
                Ok(outcome) => debug!("Turn {} drained: {:?}", active.id, outcome),
                Err(e) => warn!("Turn {} ended abnormally: {}", active.id, e),
            }
        }
        self.capture = None;

        self.send(ServerEvent::Interrupted);
        let mut machine = self.handles.machine.lock();
        if machine.finish_interrupt() {
            self.send(ServerEvent::TurnState {
                state: TurnState::Idle,
            });
        }
        true
    }

    fn stop_audio(&mut self) {
        let mute = self.active.as_ref().map(|active| {
            debug!("Muting speech for turn {}", active.id);
            active.mute.as_ref()
        });
        if let Err(e) = self.handles.outbound.mute_and_send(mute, &ServerEvent::AudioStopped) {
            debug!("Could not send audio_stopped: {}", e);
        }
    }

    /// Queue an engine-backed settings change. The answer arrives from the
    /// worker, after any request queued before it.
    fn request_settings(&mut self, request: SettingsRequest) {
        let worker = self.settings_worker.get_or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = SettingsWorker {
                engines: self.handles.engines.clone(),
                outbound: self.handles.outbound.clone(),
                voice: self.voice.clone(),
            };
            let cancel = self.handles.session_cancel.clone();
            self.handles
                .background
                .spawn(worker.run(rx, cancel).in_current_span());
            tx
        });
        if let Err(e) = worker.send(request) {
            warn!("Settings worker is gone, dropping {:?}", e.0);
        }
    }

    async fn set_call_mode(&mut self, enabled: bool) {
        if enabled == self.segmenter.is_some() {
            self.send(ServerEvent::ack("call_mode", enabled));
            return;
        }

        if enabled {
            match VadSegmenter::new(self.config.vad.clone(), self.config.input_sample_rate) {
                Ok(segmenter) => {
                    info!("Call mode on ({:?} detector)", self.config.vad.detector);
                    self.segmenter = Some(segmenter);
                    self.settings.call_mode = true;
                }
                Err(e) => {
                    warn!("Could not start call mode: {}", e);
                    self.send(ServerEvent::error(e.to_string()));
                    return;
                }
            }
        } else {
            info!("Call mode off");
            self.settings.call_mode = false;
            if let Some(event) = self.segmenter.take().and_then(|mut s| s.flush()) {
                self.on_segment_event(event).await;
            } else if self.capture.take().is_some() {
                self.set_state(TurnState::Idle);
            }
        }
        self.send(ServerEvent::ack("call_mode", enabled));
    }

    /// Transitions made outside a turn: capture start and abandon
    fn set_state(&self, to: TurnState) {
        let mut machine = self.handles.machine.lock();
        match machine.advance(to) {
            Ok(true) => self.send(ServerEvent::TurnState { state: to }),
            Ok(false) => {}
            Err(e) => debug!("Ignoring session transition: {}", e),
        }
    }

    fn reply_ack(&self, result: Result<()>, key: &str, index: usize) {
        match result {
            Ok(()) => self.send(ServerEvent::ack(key, index)),
            Err(e) => self.send(ServerEvent::error(e.to_string())),
        }
    }

    fn send(&self, event: ServerEvent) {
        if let Err(e) = self.handles.outbound.send(&event) {
            debug!("Dropping session event: {}", e);
        }
    }
}

fn message_kind(message: &ClientMessage) -> &'static str {
    match message {
        ClientMessage::UserAudioStart => "user_audio_start",
        ClientMessage::UserAudioEnd => "user_audio_end",
        ClientMessage::TextMessage { .. } => "text_message",
        ClientMessage::ResendLast => "resend_last",
        ClientMessage::Interrupt => "interrupt",
        ClientMessage::StopAudio => "stop_audio",
        ClientMessage::ClearChat => "clear_chat",
        ClientMessage::SyncHistory { .. } => "sync_history",
        ClientMessage::EditMessage { .. } => "edit_message",
        ClientMessage::DeleteMessage { .. } => "delete_message",
        ClientMessage::Rewind { .. } => "rewind",
        ClientMessage::SetLlmModel { .. } => "set_llm_model",
        ClientMessage::SetLlmHost { .. } => "set_llm_host",
        ClientMessage::SetTtsEngine { .. } => "set_tts_engine",
        ClientMessage::SetVoice { .. } => "set_voice",
        ClientMessage::GetAvailableVoices => "get_available_voices",
        ClientMessage::SetOutputMode { .. } => "set_output_mode",
        ClientMessage::SetContextMode { .. } => "set_context_mode",
        ClientMessage::SetImagegenMode { .. } => "set_imagegen_mode",
        ClientMessage::SetSystemPrompt { .. } => "set_system_prompt",
        ClientMessage::SetCharacterImage { .. } => "set_character_image",
        ClientMessage::SetCallMode { .. } => "set_call_mode",
    }
}
