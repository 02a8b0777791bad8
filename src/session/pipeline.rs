//! Streaming pipeline for one conversational turn
//!
//! Input (audio segment or text) -> transcript -> streamed reply -> speech,
//! with image generation branching off the reply stream. Every stage observes
//! the turn's cancellation token and every engine lease is released on all
//! paths. Speech synthesis runs as its own task fed phrase by phrase, so audio
//! for the first sentence is produced while the model is still generating.

use super::context::{Message, MessageImage, Role, SharedContext};
use super::events::{Outbound, ServerEvent, TurnEmitter};
use super::settings::{OutputMode, SessionSettings};
use super::turn::{SharedTurnState, TurnState};
use crate::config::{ImageGeneratorSettings, ServerConfig};
use crate::engine::{EngineLease, EngineManager};
use crate::imaging::{
    decode_base64_image, encode_base64, GeneratedImage, ImageExplainer, ImageGenerator,
    ImageRequest,
};
use crate::llm::prompts::{
    compose_image_prompt, describe_attachment, image_prompt_request, undescribed_attachment,
};
use crate::llm::{
    strip_image_directives, strip_tags, ChatMessage, ChatModel, ChatRequest, DirectiveScanner,
    PhraseChunker, ScanOutput,
};
use crate::speech::audio::duration_ms;
use crate::speech::{normalize_text_for_tts, Synthesizer, Transcriber};
use crate::utils::{LatencyStats, Stopwatch, TurnTimings};
use crate::{ParleyError, Result};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

const ATTACHMENT_QUESTION: &str = "What do you see in this image?";

#[derive(Debug, Clone, PartialEq)]
pub enum TurnInput {
    /// A finished capture segment, mono PCM
    Audio { samples: Vec<i16>, sample_rate: u32 },
    /// Typed text with an optional base64 image
    Text { text: String, image: Option<String> },
    /// New reply to the last stored user message
    Resend,
}

#[derive(Debug)]
pub enum TurnOutcome {
    Completed { message_id: Uuid, timings: TurnTimings },
    /// Short capture or empty transcript; nothing was stored
    Empty,
    Cancelled,
    Failed(ParleyError),
}

/// Turn tunables taken from the server configuration
#[derive(Clone, Debug)]
pub struct TurnOptions {
    pub min_capture_ms: u64,
    pub max_phrase_words: usize,
    pub optimize_image_prompts: bool,
    pub image: ImageGeneratorSettings,
}

impl TurnOptions {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            min_capture_ms: config.min_capture_ms as u64,
            max_phrase_words: config.chunking.max_words,
            optimize_image_prompts: config.llm.optimize_image_prompts,
            image: config.image_generator.clone(),
        }
    }
}

/// What a turn borrows from its session
#[derive(Clone)]
pub struct SessionHandles {
    pub engines: Arc<EngineManager>,
    pub context: SharedContext,
    pub machine: SharedTurnState,
    pub outbound: Outbound,
    /// Cancelled when the session ends. Background image work observes this
    /// token rather than the turn's, so it survives barge-in.
    pub session_cancel: CancellationToken,
    pub background: TaskTracker,
    pub options: Arc<TurnOptions>,
    pub latency: Arc<Mutex<LatencyStats>>,
}

pub struct TurnCoordinator {
    handles: SessionHandles,
    settings: SessionSettings,
    emitter: TurnEmitter,
    cancel: CancellationToken,
    mute: Arc<AtomicBool>,
    clock: Stopwatch,
    timings: TurnTimings,
}

impl TurnCoordinator {
    pub fn new(
        handles: SessionHandles,
        settings: SessionSettings,
        emitter: TurnEmitter,
        cancel: CancellationToken,
        mute: Arc<AtomicBool>,
    ) -> Self {
        Self {
            handles,
            settings,
            emitter,
            cancel,
            mute,
            clock: Stopwatch::start(),
            timings: TurnTimings::default(),
        }
    }

    /// Drive the turn to completion. Always leaves the state machine idle,
    /// unless the turn was cancelled, in which case the canceller owns it.
    pub async fn run(mut self, input: TurnInput) -> TurnOutcome {
        let turn = self.emitter.turn();

        let outcome = match self.execute(input).await {
            Ok(Some(message_id)) => TurnOutcome::Completed {
                message_id,
                timings: self.timings.clone(),
            },
            Ok(None) => TurnOutcome::Empty,
            Err(ParleyError::Cancelled) => TurnOutcome::Cancelled,
            Err(e) => {
                warn!("Turn {} failed: {}", turn, e);
                self.emitter.emit(&ServerEvent::error(e.to_string()));
                TurnOutcome::Failed(e)
            }
        };

        if !matches!(outcome, TurnOutcome::Cancelled) {
            self.set_state(TurnState::Idle);
        }

        self.timings.total = Some(self.clock.elapsed());
        if let TurnOutcome::Completed { .. } = outcome {
            self.handles.latency.lock().record(&self.timings);
        }
        info!("Turn {} finished ({}): {}", turn, outcome_label(&outcome), self.timings.summary());

        self.handles.outbound.close_if(turn);
        outcome
    }

    async fn execute(&mut self, input: TurnInput) -> Result<Option<Uuid>> {
        let resend = matches!(input, TurnInput::Resend);
        let (content, attachment) = match input {
            TurnInput::Audio {
                samples,
                sample_rate,
            } => match self.transcribe(samples, sample_rate).await? {
                Some(text) => (text, None),
                None => return Ok(None),
            },
            TurnInput::Text { text, image } => {
                self.set_state(TurnState::GeneratingReply);
                self.prepare_text(text, image).await?
            }
            // The reply being replaced leaves the log so the prompt ends on the user message
            TurnInput::Resend => {
                let last = self
                    .handles
                    .context
                    .lock()
                    .rewind_to_last_user()
                    .ok_or_else(|| {
                        ParleyError::ProtocolError("No user message to resend".into())
                    })?;
                (last, None)
            }
        };
        self.set_state(TurnState::GeneratingReply);

        {
            let mut context = self.handles.context.lock();
            if resend || context.is_resend(&content) {
                debug!("Resending last user message");
            } else {
                let mut message = Message::user(&content);
                if let Some(image) = attachment {
                    message = message.with_image(image);
                }
                context.append(message);
            }
        }

        let request = self.build_request(&content);
        self.emitter.emit(&ServerEvent::LlmPayload {
            payload: json!({
                "model": request.model,
                "messages": request.messages,
                "stream": true,
            }),
        });

        let message_id = Uuid::new_v4();
        self.emitter.emit(&ServerEvent::AssistantStart { message_id });

        let result = self.reply(message_id, &request).await;
        if result.is_err() {
            self.handles.context.lock().forget(message_id);
        }
        match result {
            Err(ParleyError::Cancelled) => {
                self.emitter
                    .emit_always(&ServerEvent::AssistantCancelled { message_id });
                Err(ParleyError::Cancelled)
            }
            other => other.map(Some),
        }
    }

    async fn transcribe(&mut self, samples: Vec<i16>, sample_rate: u32) -> Result<Option<String>> {
        self.set_state(TurnState::Transcribing);

        let captured_ms = duration_ms(samples.len(), sample_rate);
        if captured_ms < self.handles.options.min_capture_ms {
            info!("Capture too short ({} ms), ignoring", captured_ms);
            self.emitter.emit(&ServerEvent::Transcript {
                text: String::new(),
            });
            return Ok(None);
        }

        let lease = cancellable(&self.cancel, self.handles.engines.stt().acquire()).await?;
        let result = cancellable(&self.cancel, lease.transcribe(&samples, sample_rate)).await;
        lease.release().await;

        let text = result
            .map_err(|e| match e {
                ParleyError::Cancelled | ParleyError::TranscriptionError(_) => e,
                other => ParleyError::TranscriptionError(other.to_string()),
            })?
            .trim()
            .to_string();

        TurnTimings::mark(&mut self.timings.transcript, &self.clock);
        info!("Transcript ({} ms of audio): {:?}", captured_ms, text);
        self.emitter.emit(&ServerEvent::Transcript { text: text.clone() });

        if text.is_empty() {
            return Ok(None);
        }
        Ok(Some(text))
    }

    /// Resolve typed input. An attached image is described by the explainer
    /// and the description merged into the text, since the chat model only
    /// reads text.
    async fn prepare_text(
        &mut self,
        text: String,
        image: Option<String>,
    ) -> Result<(String, Option<MessageImage>)> {
        let text = text.trim().to_string();
        let Some(image) = image.filter(|i| !i.trim().is_empty()) else {
            return Ok((text, None));
        };

        let bytes = decode_base64_image(&image)?;
        let attachment = MessageImage {
            data: encode_base64(&bytes),
            prompt: None,
            format: image_format(&bytes),
        };

        let question = if text.is_empty() {
            ATTACHMENT_QUESTION
        } else {
            text.as_str()
        };

        let content = match self.explain(&bytes, question).await {
            Ok(description) => {
                self.emitter.emit(&ServerEvent::ImageDescribed {
                    description: description.clone(),
                });
                describe_attachment(&text, &description)
            }
            Err(ParleyError::Cancelled) => return Err(ParleyError::Cancelled),
            Err(e) => {
                warn!("Could not describe attached image: {}", e);
                undescribed_attachment(&text)
            }
        };

        Ok((content, Some(attachment)))
    }

    async fn explain(&self, image: &[u8], question: &str) -> Result<String> {
        let explainer = self.handles.engines.image_explainer();
        let lease = cancellable(&self.cancel, explainer.acquire()).await?;
        let result = cancellable(&self.cancel, lease.explain(image, question)).await;
        lease.release().await;
        result
    }

    fn build_request(&self, content: &str) -> ChatRequest {
        let system = self
            .settings
            .system_prompt(self.handles.engines.image_generation_available());
        let mut messages = vec![ChatMessage::system(system)];

        if self.settings.use_context {
            let context = self.handles.context.lock();
            messages.extend(context.chat_history());
            // Already the last entry for a resend
            let ends_with_turn = context
                .last()
                .map(|m| m.role == Role::User && m.content == content)
                .unwrap_or(false);
            if !ends_with_turn {
                messages.push(ChatMessage::user(content));
            }
        } else {
            messages.push(ChatMessage::user(content));
        }

        ChatRequest::new(messages)
            .with_model(&self.settings.llm_model)
            .with_host(&self.settings.llm_host)
    }

    async fn reply(&mut self, message_id: Uuid, request: &ChatRequest) -> Result<Uuid> {
        let speech_cancel = self.cancel.child_token();
        let (phrase_tx, speech_task) = match self.settings.output_mode {
            OutputMode::Voice => {
                let (tx, rx) = mpsc::unbounded_channel();
                let stage = SpeechStage {
                    engines: self.handles.engines.clone(),
                    emitter: self.emitter.clone(),
                    machine: self.handles.machine.clone(),
                    cancel: speech_cancel.clone(),
                    mute: self.mute.clone(),
                    voice: self.settings.voice.clone(),
                    clock: self.clock,
                };
                let task = tokio::spawn(stage.run(rx).in_current_span());
                (Some(tx), Some(task))
            }
            OutputMode::Text => (None, None),
        };

        let mut images = None;
        let generated = self
            .generate(request, message_id, phrase_tx.as_ref(), &mut images)
            .await;
        drop(phrase_tx);
        drop(images);

        let reply = match generated {
            Ok(reply) => reply,
            Err(e) => {
                speech_cancel.cancel();
                if let Some(task) = speech_task {
                    let _ = task.await;
                }
                return Err(e);
            }
        };

        if let Some(task) = speech_task {
            match task.await {
                Ok(report) => {
                    self.timings.first_audio = report.first_audio;
                    debug!("Spoke {} chunk(s)", report.chunks);
                }
                Err(e) => warn!("Speech task ended abnormally: {}", e),
            }
        }

        // A barge-in while the reply was still being spoken discards it
        if self.cancel.is_cancelled() {
            return Err(ParleyError::Cancelled);
        }

        let text = strip_image_directives(&reply);
        self.handles
            .context
            .lock()
            .append(Message::assistant(&text).with_id(message_id));
        self.emitter
            .emit(&ServerEvent::AssistantEnd { message_id, text });
        Ok(message_id)
    }

    async fn generate(
        &mut self,
        request: &ChatRequest,
        message_id: Uuid,
        phrases: Option<&mpsc::UnboundedSender<String>>,
        images: &mut Option<mpsc::UnboundedSender<String>>,
    ) -> Result<String> {
        let lease = cancellable(&self.cancel, self.handles.engines.llm().acquire()).await?;
        let result = self
            .consume_stream(&lease, request, message_id, phrases, images)
            .await;
        lease.release().await;
        result.map_err(generation_error)
    }

    async fn consume_stream(
        &mut self,
        model: &EngineLease<dyn ChatModel>,
        request: &ChatRequest,
        message_id: Uuid,
        phrases: Option<&mpsc::UnboundedSender<String>>,
        images: &mut Option<mpsc::UnboundedSender<String>>,
    ) -> Result<String> {
        let mut stream = cancellable(&self.cancel, model.stream_chat(request)).await?;
        let mut scanner = DirectiveScanner::new();
        let mut chunker = PhraseChunker::new(self.handles.options.max_phrase_words);
        let mut reply = String::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ParleyError::Cancelled),
                next = stream.next() => next,
            };
            let delta = match next {
                None => break,
                Some(Ok(delta)) => delta,
                Some(Err(e)) => return Err(e),
            };
            if delta.is_empty() {
                continue;
            }

            TurnTimings::mark(&mut self.timings.first_token, &self.clock);
            reply.push_str(&delta);

            let scanned = scanner.feed(&delta);
            self.forward_scan(scanned, message_id, images);
            for phrase in chunker.feed(&delta) {
                queue_phrase(phrases, &phrase);
            }
        }

        let scanned = scanner.flush();
        self.forward_scan(scanned, message_id, images);
        if let Some(rest) = chunker.flush() {
            queue_phrase(phrases, &rest);
        }

        Ok(reply)
    }

    fn forward_scan(
        &mut self,
        scanned: ScanOutput,
        message_id: Uuid,
        images: &mut Option<mpsc::UnboundedSender<String>>,
    ) {
        if !scanned.display.is_empty() {
            self.emitter.emit(&ServerEvent::AssistantDelta {
                delta: scanned.display,
            });
        }
        for scene in scanned.directives {
            self.request_image(message_id, scene, images);
        }
    }

    /// Queue an image for the reply. The first request starts a background
    /// worker that outlives the turn.
    fn request_image(
        &mut self,
        message_id: Uuid,
        scene: String,
        images: &mut Option<mpsc::UnboundedSender<String>>,
    ) {
        if !self.settings.include_imagegen {
            debug!("Image generation disabled for this session, ignoring: {}", scene);
            return;
        }
        if !self.handles.engines.image_generation_available() {
            debug!("No image generator configured, ignoring: {}", scene);
            return;
        }

        if images.is_none() {
            let (tx, rx) = mpsc::unbounded_channel();
            let job = ImageJob {
                engines: self.handles.engines.clone(),
                context: self.handles.context.clone(),
                outbound: self.handles.outbound.clone(),
                cancel: self.handles.session_cancel.clone(),
                message_id,
                character_description: self.settings.character_description.clone(),
                llm_model: self.settings.llm_model.clone(),
                llm_host: self.settings.llm_host.clone(),
                optimize: self.handles.options.optimize_image_prompts,
                image: self.handles.options.image.clone(),
            };
            self.handles
                .background
                .spawn(job.run(rx).in_current_span());
            *images = Some(tx);

            if self.handles.machine.lock().state() == TurnState::GeneratingReply {
                self.set_state(TurnState::GeneratingImage);
            }
        }

        if let Some(tx) = images.as_ref() {
            let _ = tx.send(scene);
        }
    }

    fn set_state(&self, to: TurnState) {
        advance_state(&self.handles.machine, &self.emitter, &self.cancel, to);
    }
}

/// Advance the machine and announce the change. The event is sent under the
/// machine lock so announcements cannot be reordered between tasks.
fn advance_state(
    machine: &SharedTurnState,
    emitter: &TurnEmitter,
    cancel: &CancellationToken,
    to: TurnState,
) {
    if cancel.is_cancelled() {
        return;
    }
    let mut machine = machine.lock();
    match machine.advance(to) {
        Ok(true) => {
            emitter.emit(&ServerEvent::TurnState { state: to });
        }
        Ok(false) => {}
        Err(e) => debug!("Ignoring turn transition: {}", e),
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ParleyError::Cancelled),
        result = future => result,
    }
}

fn generation_error(e: ParleyError) -> ParleyError {
    match e {
        ParleyError::GenerationError(_)
        | ParleyError::Cancelled
        | ParleyError::EngineLoadError(_)
        | ParleyError::EngineUnavailable(_) => e,
        other => ParleyError::GenerationError(other.to_string()),
    }
}

fn queue_phrase(phrases: Option<&mpsc::UnboundedSender<String>>, phrase: &str) {
    let Some(tx) = phrases else {
        return;
    };
    let spoken = normalize_text_for_tts(&strip_tags(phrase));
    if spoken.chars().any(char::is_alphanumeric) {
        let _ = tx.send(spoken);
    }
}

fn image_format(bytes: &[u8]) -> String {
    image::guess_format(bytes)
        .ok()
        .and_then(|f| f.extensions_str().first().copied())
        .unwrap_or("png")
        .to_string()
}

fn outcome_label(outcome: &TurnOutcome) -> &'static str {
    match outcome {
        TurnOutcome::Completed { .. } => "completed",
        TurnOutcome::Empty => "empty",
        TurnOutcome::Cancelled => "cancelled",
        TurnOutcome::Failed(_) => "failed",
    }
}

#[derive(Debug, Default)]
struct SpeechReport {
    chunks: usize,
    first_audio: Option<Duration>,
}

/// Synthesizes phrases in arrival order and emits each as one audio group
struct SpeechStage {
    engines: Arc<EngineManager>,
    emitter: TurnEmitter,
    machine: SharedTurnState,
    cancel: CancellationToken,
    mute: Arc<AtomicBool>,
    voice: Option<String>,
    clock: Stopwatch,
}

impl SpeechStage {
    async fn run(self, mut phrases: mpsc::UnboundedReceiver<String>) -> SpeechReport {
        let mut report = SpeechReport::default();
        let mut lease = None;
        let mut failed = false;

        loop {
            let phrase = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                phrase = phrases.recv() => match phrase {
                    Some(phrase) => phrase,
                    None => break,
                },
            };
            // Keep draining so the generator never blocks on a dead stage
            if failed || self.mute.load(Ordering::SeqCst) {
                continue;
            }

            if lease.is_none() {
                match cancellable(&self.cancel, self.engines.tts().acquire()).await {
                    Ok(acquired) => lease = Some(acquired),
                    Err(ParleyError::Cancelled) => break,
                    Err(e) => {
                        self.report_failure(&e);
                        failed = true;
                        continue;
                    }
                }
            }
            let Some(engine) = lease.as_ref() else {
                continue;
            };

            advance_state(
                &self.machine,
                &self.emitter,
                &self.cancel,
                TurnState::SynthesizingSpeech,
            );
            debug!("Synthesizing: {}", phrase);

            let audio = match cancellable(
                &self.cancel,
                engine.synthesize(&phrase, self.voice.as_deref()),
            )
            .await
            {
                Ok(audio) => audio,
                Err(ParleyError::Cancelled) => break,
                Err(e) => {
                    self.report_failure(&e);
                    failed = true;
                    continue;
                }
            };

            if audio.is_empty() || self.mute.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
                continue;
            }
            if !self.emitter.emit_audio_unless(&audio, &self.mute) {
                break;
            }
            report.chunks += 1;
            TurnTimings::mark(&mut report.first_audio, &self.clock);
        }

        if let Some(lease) = lease {
            lease.release().await;
        }
        report
    }

    fn report_failure(&self, e: &ParleyError) {
        let e = match e {
            ParleyError::SynthesisError(_) | ParleyError::EngineLoadError(_) => e.clone(),
            other => ParleyError::SynthesisError(other.to_string()),
        };
        warn!("Speech synthesis failed, continuing with text only: {}", e);
        self.emitter.emit(&ServerEvent::error(format!("Audio generation failed: {}", e)));
    }
}

/// Background generation of the images requested by one reply
struct ImageJob {
    engines: Arc<EngineManager>,
    context: SharedContext,
    outbound: Outbound,
    cancel: CancellationToken,
    message_id: Uuid,
    character_description: Option<String>,
    llm_model: String,
    llm_host: String,
    optimize: bool,
    image: ImageGeneratorSettings,
}

impl ImageJob {
    async fn run(self, mut scenes: mpsc::UnboundedReceiver<String>) {
        while let Some(scene) = scenes.recv().await {
            if self.cancel.is_cancelled() {
                break;
            }
            self.generate_one(&scene).await;
        }
    }

    async fn generate_one(&self, scene: &str) {
        let prompt = self.prompt_for(scene).await;
        self.send(ServerEvent::ImageGenerating {
            message_id: self.message_id,
            prompt: prompt.clone(),
        });

        match self.render(&prompt).await {
            Ok(image) => {
                let data = image.to_base64();
                let image = MessageImage::png(data.clone(), Some(prompt.clone()));
                let attached = self.context.lock().attach_image(self.message_id, image);
                info!("Image for {} ready ({:?})", self.message_id, attached);
                self.send(ServerEvent::ImageGenerated {
                    message_id: self.message_id,
                    image: data,
                    prompt,
                    format: "png".to_string(),
                });
            }
            Err(ParleyError::Cancelled) => debug!("Image generation cancelled"),
            Err(e) => {
                warn!("Image generation failed: {}", e);
                self.send(ServerEvent::ImageError {
                    message_id: self.message_id,
                    error: e.to_string(),
                    prompt,
                });
            }
        }
    }

    async fn prompt_for(&self, scene: &str) -> String {
        let scene = if self.optimize {
            match self.optimize_prompt(scene).await {
                Ok(optimized) if !optimized.trim().is_empty() => {
                    debug!("Optimized image prompt: {} -> {}", scene, optimized.trim());
                    optimized.trim().to_string()
                }
                Ok(_) => scene.to_string(),
                Err(e) => {
                    warn!("Image prompt optimization failed, using the raw prompt: {}", e);
                    scene.to_string()
                }
            }
        } else {
            scene.to_string()
        };
        compose_image_prompt(self.character_description.as_deref(), &scene)
    }

    async fn optimize_prompt(&self, scene: &str) -> Result<String> {
        let lease = cancellable(&self.cancel, self.engines.llm().acquire()).await?;
        let request = ChatRequest::new(image_prompt_request(scene))
            .with_model(&self.llm_model)
            .with_host(&self.llm_host);
        let result = cancellable(&self.cancel, lease.complete(&request)).await;
        lease.release().await;
        result
    }

    async fn render(&self, prompt: &str) -> Result<GeneratedImage> {
        let lease = cancellable(&self.cancel, self.engines.image_generator().acquire()).await?;
        let request = ImageRequest::from_settings(prompt, &self.image);
        let result = cancellable(&self.cancel, lease.generate(&request)).await;
        lease.release().await;
        result
    }

    fn send(&self, event: ServerEvent) {
        if let Err(e) = self.outbound.send(&event) {
            debug!("Dropping image event: {}", e);
        }
    }
}
