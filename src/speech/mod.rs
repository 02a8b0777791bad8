pub mod audio;
pub mod stt;
pub mod tts;
pub mod vad;

pub use stt::{Transcriber, WhisperClient};
pub use tts::{normalize_text_for_tts, HttpSynthesizer, SpeechAudio, Synthesizer};
pub use vad::{SegmentEndReason, SegmentEvent, VadSegmenter};
