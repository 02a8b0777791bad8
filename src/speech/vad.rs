//! Voice activity segmentation for call mode
//!
//! Inbound frames are classified by a [`SpeechDetector`] and grouped into
//! utterances. An utterance only counts as speech once it has accumulated
//! `min_speech_ms` of voiced audio, so clicks and coughs never barge in.

use super::audio::{duration_ms, i16_to_f32, rms};
use crate::config::{VadDetector, VadSettings};
use crate::{ParleyError, Result};
use ringbuf::{traits::*, HeapRb};
use tracing::{debug, info};
use voice_activity_detector::VoiceActivityDetector;

pub trait SpeechDetector: Send {
    /// Classify one frame of mono 16-bit audio
    fn is_speech(&mut self, samples: &[i16]) -> bool;

    fn reset(&mut self) {}
}

/// RMS level detector
pub struct EnergyDetector {
    threshold: f32,
}

impl EnergyDetector {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl SpeechDetector for EnergyDetector {
    fn is_speech(&mut self, samples: &[i16]) -> bool {
        rms(samples) >= self.threshold
    }
}

/// Silero VAD; frames are re-chunked to the model's fixed window
pub struct SileroDetector {
    detector: VoiceActivityDetector,
    threshold: f32,
    chunk_size: usize,
    pending: Vec<f32>,
    last: bool,
}

impl SileroDetector {
    pub fn new(sample_rate: u32, threshold: f32) -> Result<Self> {
        let chunk_size: usize = match sample_rate {
            8000 => 256,
            16000 => 512,
            other => {
                return Err(ParleyError::ConfigError(format!(
                    "Invalid sample rate for Silero VAD: {}. Must be 8000 or 16000",
                    other
                )))
            }
        };

        let detector = VoiceActivityDetector::builder()
            .sample_rate(sample_rate as i32)
            .chunk_size(chunk_size)
            .build()
            .map_err(|e| {
                ParleyError::AudioProcessingError(format!("Failed to create VAD: {:?}", e))
            })?;

        info!("Initialized Silero VAD at {} Hz, threshold {}", sample_rate, threshold);

        Ok(Self {
            detector,
            threshold,
            chunk_size,
            pending: Vec::with_capacity(chunk_size * 2),
            last: false,
        })
    }
}

impl SpeechDetector for SileroDetector {
    fn is_speech(&mut self, samples: &[i16]) -> bool {
        self.pending.extend(i16_to_f32(samples));
        if self.pending.len() < self.chunk_size {
            return self.last;
        }

        let mut speech = false;
        let whole = self.pending.len() - self.pending.len() % self.chunk_size;
        for chunk in self.pending[..whole].chunks_exact(self.chunk_size) {
            let probability = self.detector.predict(chunk.iter().copied());
            speech |= probability >= self.threshold;
        }
        self.pending.drain(..whole);
        self.last = speech;
        speech
    }

    fn reset(&mut self) {
        self.detector.reset();
        self.pending.clear();
        self.last = false;
    }
}

pub fn build_detector(settings: &VadSettings, sample_rate: u32) -> Result<Box<dyn SpeechDetector>> {
    Ok(match settings.detector {
        VadDetector::Energy => Box::new(EnergyDetector::new(settings.threshold)),
        VadDetector::Silero => Box::new(SileroDetector::new(sample_rate, settings.threshold)?),
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentEndReason {
    Silence,
    MaxDuration,
    StreamStopped,
}

#[derive(Debug, PartialEq)]
pub enum SegmentEvent {
    /// Enough voiced audio to count as the user speaking
    SpeechStarted,
    /// A finished utterance, pre-roll included
    SegmentEnded {
        samples: Vec<i16>,
        reason: SegmentEndReason,
    },
}

#[derive(Default)]
struct ActiveUtterance {
    samples: Vec<i16>,
    voiced_ms: u64,
    total_ms: u64,
    silence_ms: u64,
    announced: bool,
}

pub struct VadSegmenter {
    settings: VadSettings,
    sample_rate: u32,
    detector: Box<dyn SpeechDetector>,
    pre_roll: HeapRb<i16>,
    active: Option<ActiveUtterance>,
}

impl VadSegmenter {
    pub fn new(settings: VadSettings, sample_rate: u32) -> Result<Self> {
        let detector = build_detector(&settings, sample_rate)?;
        Ok(Self::with_detector(settings, sample_rate, detector))
    }

    pub fn with_detector(
        settings: VadSettings,
        sample_rate: u32,
        detector: Box<dyn SpeechDetector>,
    ) -> Self {
        let capacity = (settings.pre_roll_ms as usize * sample_rate as usize / 1000).max(1);
        Self {
            settings,
            sample_rate,
            detector,
            pre_roll: HeapRb::new(capacity),
            active: None,
        }
    }

    pub fn is_in_speech(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.announced)
    }

    /// Feed one inbound frame
    pub fn push(&mut self, samples: &[i16]) -> Vec<SegmentEvent> {
        let mut events = Vec::new();
        if samples.is_empty() {
            return events;
        }

        let frame_ms = duration_ms(samples.len(), self.sample_rate);
        let is_speech = self.detector.is_speech(samples);

        match self.active.as_mut() {
            None if is_speech => {
                let mut utterance = ActiveUtterance::default();
                utterance.samples.extend(self.pre_roll.pop_iter());
                utterance.samples.extend_from_slice(samples);
                utterance.voiced_ms = frame_ms;
                utterance.total_ms = frame_ms;
                self.active = Some(utterance);
            }
            None => {
                self.push_pre_roll(samples);
                return events;
            }
            Some(active) => {
                active.samples.extend_from_slice(samples);
                active.total_ms += frame_ms;
                if is_speech {
                    active.voiced_ms += frame_ms;
                    active.silence_ms = 0;
                } else {
                    active.silence_ms += frame_ms;
                }
            }
        }

        let min_speech_ms = self.settings.min_speech_ms as u64;
        let Some(active) = self.active.as_mut() else {
            return events;
        };

        if !active.announced && active.voiced_ms >= min_speech_ms {
            active.announced = true;
            events.push(SegmentEvent::SpeechStarted);
        }

        let reason = if active.total_ms >= self.settings.max_utterance_ms as u64 {
            Some(SegmentEndReason::MaxDuration)
        } else if active.silence_ms >= self.settings.silence_ms as u64 {
            Some(SegmentEndReason::Silence)
        } else {
            None
        };

        if let Some(reason) = reason {
            if let Some(event) = self.finish(reason) {
                events.push(event);
            }
        }

        events
    }

    /// Close any open utterance, e.g. when call mode is switched off
    pub fn flush(&mut self) -> Option<SegmentEvent> {
        self.finish(SegmentEndReason::StreamStopped)
    }

    pub fn reset(&mut self) {
        self.active = None;
        self.pre_roll.clear();
        self.detector.reset();
    }

    fn finish(&mut self, reason: SegmentEndReason) -> Option<SegmentEvent> {
        let active = self.active.take()?;
        if !active.announced {
            debug!(
                "Dropping {} ms blip ({} ms voiced)",
                active.total_ms, active.voiced_ms
            );
            return None;
        }
        debug!(
            "Utterance ended ({:?}): {} ms total, {} ms voiced",
            reason, active.total_ms, active.voiced_ms
        );
        Some(SegmentEvent::SegmentEnded {
            samples: active.samples,
            reason,
        })
    }

    fn push_pre_roll(&mut self, samples: &[i16]) {
        for &sample in samples {
            self.pre_roll.push_overwrite(sample);
        }
    }
}
