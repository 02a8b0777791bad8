//! Latency measurement for conversational turns

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Tracks timing metrics over a sliding window
#[derive(Debug)]
pub struct TimingTracker {
    samples: VecDeque<Duration>,
    max_samples: usize,
}

impl TimingTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
        }
    }

    pub fn record(&mut self, duration: Duration) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(duration);
    }

    pub fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }

    pub fn percentile_95(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<_> = self.samples.iter().copied().collect();
        sorted.sort();
        let idx = (sorted.len() as f32 * 0.95) as usize;
        sorted.get(idx.min(sorted.len() - 1)).copied().unwrap_or(Duration::ZERO)
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}

/// Averages over recent turns, reported by the status endpoint
#[derive(Debug)]
pub struct LatencyStats {
    first_token: TimingTracker,
    first_audio: TimingTracker,
    total: TimingTracker,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencySummary {
    pub turns: usize,
    pub avg_first_token_ms: u64,
    pub avg_first_audio_ms: u64,
    pub avg_total_ms: u64,
    pub p95_total_ms: u64,
}

impl LatencyStats {
    pub fn new(window: usize) -> Self {
        Self {
            first_token: TimingTracker::new(window),
            first_audio: TimingTracker::new(window),
            total: TimingTracker::new(window),
        }
    }

    pub fn record(&mut self, timings: &TurnTimings) {
        if let Some(d) = timings.first_token {
            self.first_token.record(d);
        }
        if let Some(d) = timings.first_audio {
            self.first_audio.record(d);
        }
        if let Some(d) = timings.total {
            self.total.record(d);
        }
    }

    pub fn summary(&self) -> LatencySummary {
        LatencySummary {
            turns: self.total.count(),
            avg_first_token_ms: self.first_token.average().as_millis() as u64,
            avg_first_audio_ms: self.first_audio.average().as_millis() as u64,
            avg_total_ms: self.total.average().as_millis() as u64,
            p95_total_ms: self.total.percentile_95().as_millis() as u64,
        }
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new(50)
    }
}

/// A simple stopwatch for measuring elapsed time
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    start: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Milestones of one turn, measured from the moment it started
#[derive(Debug, Clone, Default)]
pub struct TurnTimings {
    pub transcript: Option<Duration>,
    pub first_token: Option<Duration>,
    pub first_audio: Option<Duration>,
    pub total: Option<Duration>,
}

impl TurnTimings {
    /// Record only the first occurrence of a milestone
    pub fn mark(slot: &mut Option<Duration>, clock: &Stopwatch) {
        if slot.is_none() {
            *slot = Some(clock.elapsed());
        }
    }

    pub fn summary(&self) -> String {
        let parts: Vec<String> = [
            ("STT", self.transcript),
            ("TTFT", self.first_token),
            ("TTFA", self.first_audio),
            ("Total", self.total),
        ]
        .iter()
        .filter_map(|(label, d)| d.map(|d| format!("{}: {}ms", label, d.as_millis())))
        .collect();

        if parts.is_empty() {
            "no timings".to_string()
        } else {
            parts.join(" | ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_tracker_window() {
        let mut tracker = TimingTracker::new(3);

        for i in 1..=5 {
            tracker.record(Duration::from_millis(i * 10));
        }

        // Only the last 3 samples remain
        assert_eq!(tracker.count(), 3);
        assert_eq!(tracker.average(), Duration::from_millis(40));
        assert_eq!(tracker.percentile_95(), Duration::from_millis(50));
    }

    #[test]
    fn test_turn_timings_mark_once() {
        let clock = Stopwatch::start();
        let mut timings = TurnTimings::default();
        TurnTimings::mark(&mut timings.first_token, &clock);
        let first = timings.first_token;
        std::thread::sleep(Duration::from_millis(5));
        TurnTimings::mark(&mut timings.first_token, &clock);
        assert_eq!(timings.first_token, first);
        assert!(timings.summary().starts_with("TTFT"));
        assert_eq!(TurnTimings::default().summary(), "no timings");
    }

    #[test]
    fn test_latency_stats() {
        let mut stats = LatencyStats::new(10);
        stats.record(&TurnTimings {
            transcript: None,
            first_token: Some(Duration::from_millis(100)),
            first_audio: Some(Duration::from_millis(300)),
            total: Some(Duration::from_millis(900)),
        });
        stats.record(&TurnTimings {
            total: Some(Duration::from_millis(1100)),
            ..Default::default()
        });

        let summary = stats.summary();
        assert_eq!(summary.turns, 2);
        assert_eq!(summary.avg_first_token_ms, 100);
        assert_eq!(summary.avg_total_ms, 1000);
    }
}
