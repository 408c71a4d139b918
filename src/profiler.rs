//! Performance Profiler: a per-worker rolling window of completion samples,
//! recomputed into percentile statistics used by placement's capacity and
//! concurrency derivation (§4.4, §4.9).

use std::collections::VecDeque;
use std::time::Instant;

const RING_CAPACITY: usize = 1000;
const MIN_SAMPLES_FOR_STATS: usize = 10;

#[derive(Debug, Clone, Copy)]
struct Sample {
    #[allow(dead_code)]
    timestamp: Instant,
    duration_ms: u64,
    #[allow(dead_code)]
    tokens: u32,
    success: bool,
}

/// Rolling statistics derived from the last up-to-1000 completion samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Profile {
    pub samples: usize,
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub success_rate: f64,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            samples: 0,
            avg_ms: 0.0,
            min_ms: 0,
            max_ms: 0,
            p50_ms: 0,
            p95_ms: 0,
            p99_ms: 0,
            success_rate: 1.0,
        }
    }
}

/// Per-worker ring buffer of completion telemetry plus the derived `Profile`.
///
/// `profile()` is only recomputed once at least [`MIN_SAMPLES_FOR_STATS`]
/// samples are present, matching the teacher's percentile-tracker convention
/// of not reporting noisy statistics off a handful of points.
pub struct Profiler {
    ring: VecDeque<Sample>,
    profile: Profile,
}

impl Profiler {
    pub fn new() -> Self {
        Self {
            ring: VecDeque::with_capacity(RING_CAPACITY),
            profile: Profile::default(),
        }
    }

    /// Records one completed request and recomputes the profile if enough
    /// samples are now present.
    pub fn record(&mut self, duration_ms: u64, tokens: u32, success: bool) {
        if self.ring.len() == RING_CAPACITY {
            self.ring.pop_front();
        }
        self.ring.push_back(Sample {
            timestamp: Instant::now(),
            duration_ms,
            tokens,
            success,
        });

        if self.ring.len() >= MIN_SAMPLES_FOR_STATS {
            self.recompute();
        }
    }

    fn recompute(&mut self) {
        let mut durations: Vec<u64> = self.ring.iter().map(|s| s.duration_ms).collect();
        durations.sort_unstable();

        let count = durations.len();
        let sum: u64 = durations.iter().sum();
        let succeeded = self.ring.iter().filter(|s| s.success).count();

        self.profile = Profile {
            samples: count,
            avg_ms: sum as f64 / count as f64,
            min_ms: durations[0],
            max_ms: durations[count - 1],
            p50_ms: percentile(&durations, 0.50),
            p95_ms: percentile(&durations, 0.95),
            p99_ms: percentile(&durations, 0.99),
            success_rate: succeeded as f64 / count as f64,
        };
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    pub fn sample_count(&self) -> usize {
        self.ring.len()
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}
