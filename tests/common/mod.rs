//! In-process engines and a websocket-free session harness

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use parley::config::ServerConfig;
use parley::engine::{Device, EngineManager, EngineSet, Lifecycle, ReleasePolicy};
use parley::imaging::{GeneratedImage, ImageExplainer, ImageGenerator, ImageRequest};
use parley::llm::{ChatModel, ChatRequest, DeltaStream};
use parley::session::{OutboundFrame, Outbound, SessionController};
use parley::speech::{SpeechAudio, Synthesizer, Transcriber};
use parley::utils::LatencyStats;
use parley::{ParleyError, Result};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// 1x1 transparent PNG
pub const TINY_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

/// Load/unload bookkeeping shared by every mock
#[derive(Default)]
pub struct MockLifecycle {
    pub loads: AtomicUsize,
    pub unloads: AtomicUsize,
    pub fail_load: AtomicBool,
    pub fail_unload: AtomicBool,
    pub load_delay: Mutex<Duration>,
}

impl MockLifecycle {
    async fn load(&self) -> Result<u64> {
        let delay = *self.load_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(ParleyError::HttpError("connection refused".into()));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(512)
    }

    async fn unload(&self) -> Result<()> {
        if self.fail_unload.load(Ordering::SeqCst) {
            return Err(ParleyError::HttpError("device busy".into()));
        }
        self.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }
}

macro_rules! mock_lifecycle {
    ($ty:ty, $name:expr) => {
        #[async_trait]
        impl Lifecycle for $ty {
            fn name(&self) -> String {
                $name.to_string()
            }

            fn device(&self) -> Device {
                Device::Accelerator
            }

            async fn load(&self) -> Result<u64> {
                self.lifecycle.load().await
            }

            async fn unload(&self) -> Result<()> {
                self.lifecycle.unload().await
            }
        }
    };
}

#[derive(Default)]
pub struct MockTranscriber {
    pub lifecycle: MockLifecycle,
    pub transcript: Mutex<String>,
    pub calls: AtomicUsize,
}

mock_lifecycle!(MockTranscriber, "mock-stt");

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(&self, _samples: &[i16], _sample_rate: u32) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.transcript.lock().clone())
    }
}

pub struct MockSynthesizer {
    pub lifecycle: MockLifecycle,
    pub name: String,
    pub spoken: Mutex<Vec<String>>,
    pub delay: Mutex<Duration>,
    pub voices_delay: Mutex<Duration>,
    pub fail: AtomicBool,
}

impl MockSynthesizer {
    pub fn named(name: &str) -> Self {
        Self {
            lifecycle: MockLifecycle::default(),
            name: name.to_string(),
            spoken: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
            voices_delay: Mutex::new(Duration::ZERO),
            fail: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Lifecycle for MockSynthesizer {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn device(&self) -> Device {
        Device::Cpu
    }

    async fn load(&self) -> Result<u64> {
        self.lifecycle.load().await
    }

    async fn unload(&self) -> Result<()> {
        self.lifecycle.unload().await
    }
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn synthesize(&self, text: &str, _voice: Option<&str>) -> Result<SpeechAudio> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ParleyError::SynthesisError("voice model crashed".into()));
        }
        self.spoken.lock().push(text.to_string());
        Ok(SpeechAudio {
            samples: vec![1000; 220],
            sample_rate: 22050,
        })
    }

    async fn voices(&self) -> Result<Vec<String>> {
        let delay = *self.voices_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(vec!["alba".to_string(), "jenny".to_string()])
    }

    fn default_voice(&self) -> String {
        "jenny".to_string()
    }
}

/// Chat model that replays scripted replies, one per request
pub struct MockChat {
    pub lifecycle: MockLifecycle,
    pub replies: Mutex<VecDeque<Vec<String>>>,
    pub requests: Mutex<Vec<ChatRequest>>,
    pub delta_delay: Mutex<Duration>,
    /// Fail the stream after this many deltas
    pub fail_after: Mutex<Option<usize>>,
    pub completions: AtomicUsize,
}

impl Default for MockChat {
    fn default() -> Self {
        Self {
            lifecycle: MockLifecycle::default(),
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            delta_delay: Mutex::new(Duration::ZERO),
            fail_after: Mutex::new(None),
            completions: AtomicUsize::new(0),
        }
    }
}

impl MockChat {
    pub fn script(&self, deltas: &[&str]) {
        self.replies
            .lock()
            .push_back(deltas.iter().map(|d| d.to_string()).collect());
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

mock_lifecycle!(MockChat, "mock-llm");

#[async_trait]
impl ChatModel for MockChat {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<DeltaStream> {
        self.requests.lock().push(request.clone());
        let deltas = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| vec!["Hello there. ".to_string(), "How are you?".to_string()]);
        let delay = *self.delta_delay.lock();
        let fail_after = *self.fail_after.lock();

        Ok(Box::pin(async_stream::stream! {
            for (i, delta) in deltas.into_iter().enumerate() {
                if fail_after == Some(i) {
                    yield Err(ParleyError::HttpError("connection reset".into()));
                    return;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(delta);
            }
        }))
    }

    async fn complete(&self, _request: &ChatRequest) -> Result<String> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        Ok("beach, sunset, smiling".to_string())
    }

    async fn list_models(&self, _host: Option<&str>) -> Result<Vec<String>> {
        Ok(vec!["mock-llm".to_string()])
    }
}

#[derive(Default)]
pub struct MockImageGenerator {
    pub lifecycle: MockLifecycle,
    pub prompts: Mutex<Vec<String>>,
    pub delay: Mutex<Duration>,
    pub fail: AtomicBool,
}

mock_lifecycle!(MockImageGenerator, "mock-imagegen");

#[async_trait]
impl ImageGenerator for MockImageGenerator {
    async fn generate(&self, request: &ImageRequest) -> Result<GeneratedImage> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ParleyError::ImageGenerationError("out of memory".into()));
        }
        self.prompts.lock().push(request.prompt.clone());
        Ok(GeneratedImage {
            png: TINY_PNG.to_vec(),
            prompt: request.prompt.clone(),
        })
    }
}

#[derive(Default)]
pub struct MockExplainer {
    pub lifecycle: MockLifecycle,
}

mock_lifecycle!(MockExplainer, "mock-explainer");

#[async_trait]
impl ImageExplainer for MockExplainer {
    async fn explain(&self, _image: &[u8], _prompt: &str) -> Result<String> {
        Ok("A tabby cat asleep on a windowsill".to_string())
    }
}

pub struct Mocks {
    pub stt: Arc<MockTranscriber>,
    pub tts: Arc<MockSynthesizer>,
    pub alt_tts: Arc<MockSynthesizer>,
    pub llm: Arc<MockChat>,
    pub image_generator: Arc<MockImageGenerator>,
    pub explainer: Arc<MockExplainer>,
}

impl Mocks {
    pub fn new() -> Self {
        Self {
            stt: Arc::new(MockTranscriber::default()),
            tts: Arc::new(MockSynthesizer::named("piper")),
            alt_tts: Arc::new(MockSynthesizer::named("kokoro")),
            llm: Arc::new(MockChat::default()),
            image_generator: Arc::new(MockImageGenerator::default()),
            explainer: Arc::new(MockExplainer::default()),
        }
    }

    pub fn engine_set(&self, with_images: bool) -> EngineSet {
        EngineSet {
            stt: self.stt.clone(),
            tts: vec![
                ("piper".to_string(), self.tts.clone() as Arc<dyn Synthesizer>),
                ("kokoro".to_string(), self.alt_tts.clone() as Arc<dyn Synthesizer>),
            ],
            default_tts: Some("piper".to_string()),
            llm: self.llm.clone(),
            image_generator: with_images
                .then(|| self.image_generator.clone() as Arc<dyn ImageGenerator>),
            image_explainer: with_images.then(|| self.explainer.clone() as Arc<dyn ImageExplainer>),
        }
    }

    pub fn manager(&self, low_resource: bool) -> Arc<EngineManager> {
        self.manager_with(low_resource, true, Duration::from_secs(5))
    }

    pub fn manager_with(
        &self,
        low_resource: bool,
        with_images: bool,
        load_timeout: Duration,
    ) -> Arc<EngineManager> {
        let policy = ReleasePolicy::new(low_resource, load_timeout);
        Arc::new(EngineManager::new(self.engine_set(with_images), policy).unwrap())
    }
}

/// A decoded outbound frame
#[derive(Debug, Clone)]
pub enum Frame {
    Event(Value),
    Audio(usize),
}

impl Frame {
    pub fn kind(&self) -> &str {
        match self {
            Frame::Event(v) => v["type"].as_str().unwrap_or(""),
            Frame::Audio(_) => "<audio>",
        }
    }

    pub fn event(&self) -> Option<&Value> {
        match self {
            Frame::Event(v) => Some(v),
            Frame::Audio(_) => None,
        }
    }
}

pub fn kinds(frames: &[Frame]) -> Vec<String> {
    frames.iter().map(|f| f.kind().to_string()).collect()
}

pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.input_sample_rate = 16000;
    config.min_capture_ms = 100;
    config.vad.silence_ms = 200;
    config.vad.min_speech_ms = 100;
    config
}

/// A session driven directly, without a socket
pub struct Harness {
    pub mocks: Mocks,
    pub engines: Arc<EngineManager>,
    pub session: SessionController,
    rx: mpsc::UnboundedReceiver<OutboundFrame>,
}

impl Harness {
    pub fn new() -> Self {
        let mocks = Mocks::new();
        let engines = mocks.manager(true);
        Self::with(mocks, engines, test_config())
    }

    pub fn with(mocks: Mocks, engines: Arc<EngineManager>, config: ServerConfig) -> Self {
        let (outbound, rx) = Outbound::channel();
        let session = SessionController::new(
            engines.clone(),
            Arc::new(config),
            outbound,
            Arc::new(Mutex::new(LatencyStats::default())),
        );
        session.start().unwrap();
        Self {
            mocks,
            engines,
            session,
            rx,
        }
    }

    pub async fn send(&mut self, json: Value) {
        self.session.handle_text(&json.to_string()).await;
    }

    /// Everything emitted so far, without waiting
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(decode(frame));
        }
        frames
    }

    /// Collect frames until one satisfies `done` (inclusive)
    pub async fn until(&mut self, done: impl Fn(&Frame) -> bool) -> Vec<Frame> {
        let mut frames = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let frame = tokio::time::timeout_at(deadline, self.rx.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out; got {:?}", kinds(&frames)))
                .expect("outbound channel closed");
            let frame = decode(frame);
            let finished = done(&frame);
            frames.push(frame);
            if finished {
                return frames;
            }
        }
    }

    pub async fn until_kind(&mut self, kind: &str) -> Vec<Frame> {
        self.until(|f| f.kind() == kind).await
    }

    /// Wait for the turn to settle back in idle
    pub async fn until_idle(&mut self) -> Vec<Frame> {
        self.until(is_idle).await
    }

    /// Wait for a background event and for the turn to end, in either order
    pub async fn until_kind_and_idle(&mut self, kind: &str) -> Vec<Frame> {
        let mut frames = self.until_kind(kind).await;
        if !frames.iter().any(is_idle) {
            frames.extend(self.until_idle().await);
        }
        frames
    }
}

pub fn is_idle(frame: &Frame) -> bool {
    frame.kind() == "turn_state" && frame.event().map(|e| e["state"] == "idle").unwrap_or(false)
}

fn decode(frame: OutboundFrame) -> Frame {
    match frame {
        OutboundFrame::Text(text) => Frame::Event(serde_json::from_str(&text).unwrap()),
        OutboundFrame::Binary(bytes) => Frame::Audio(bytes.len()),
    }
}

/// PCM16LE frame of constant amplitude
pub fn pcm_frame(amplitude: i16, samples: usize) -> Vec<u8> {
    std::iter::repeat(amplitude)
        .take(samples)
        .flat_map(|s| s.to_le_bytes())
        .collect()
}
