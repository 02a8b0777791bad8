pub mod perf;

pub use perf::{LatencyStats, Stopwatch, TurnTimings};
