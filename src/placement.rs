//! Placement Policy: selects a destination worker for a new request using
//! power-of-two-choices sampling, with complexity routing and saturation
//! fallback strategies (§4.4).

use rand::Rng;
use std::sync::{Arc, Mutex};

use crate::classifier::{Classification, Complexity};
use crate::registry::Worker;

/// EMA smoothing factor applied to `avgTokensPerRequest` and to each
/// worker's online TPS re-estimation.
pub const EMA_ALPHA: f64 = 0.3;

/// A worker considered for placement, with its current queue pressure.
pub struct Candidate {
    pub worker: Arc<Worker>,
    pub queue_size: usize,
    pub in_flight: usize,
}

/// Derives a worker's bounded integer capacity from its measured TPS and
/// recent success rate.
pub fn derive_capacity(tps: f64, tps_per_person: f64, adaptive_multiplier: f64, success_rate: f64) -> usize {
    let tier_multiplier = if tps >= 400.0 {
        2.0
    } else if tps >= 200.0 {
        1.5
    } else if tps < 50.0 {
        0.5
    } else {
        1.0
    };

    let success_multiplier = if success_rate > 0.98 {
        1.2
    } else if success_rate < 0.9 {
        0.7
    } else {
        1.0
    };

    let raw = (tps / tps_per_person) * tier_multiplier * adaptive_multiplier * success_multiplier;
    (raw.floor() as i64).max(1) as usize
}

/// Derives a worker's concurrency ceiling from TPS, recent average
/// completion time, and p95 latency relative to the target.
pub fn derive_max_concurrent(tps: f64, avg_completion_ms: f64, p95_ms: u64, target_latency_ms: u64) -> usize {
    let mut base: i64 = if tps >= 400.0 && avg_completion_ms < 2000.0 {
        4
    } else if tps >= 200.0 && avg_completion_ms < 3000.0 {
        3
    } else if tps >= 100.0 && avg_completion_ms < 5000.0 {
        2
    } else {
        1
    };

    let target = target_latency_ms as f64;
    if (p95_ms as f64) < 0.5 * target {
        base += 1;
    } else if (p95_ms as f64) > 1.5 * target {
        base -= 1;
    }

    base.clamp(1, 8) as usize
}

/// Process-wide tracker for `avgTokensPerRequest`, an EMA over observed
/// completion token counts. Guarded by its own mutex rather than folded
/// into a per-worker lock, since it's read on every placement and written
/// on every completion across all workers.
pub struct AvgTokensTracker {
    value: Mutex<f64>,
}

impl AvgTokensTracker {
    pub fn new(initial: f64) -> Self {
        Self {
            value: Mutex::new(initial),
        }
    }

    pub fn get(&self) -> f64 {
        *self.value.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, tokens: u32) {
        let mut value = self.value.lock().unwrap_or_else(|e| e.into_inner());
        *value = EMA_ALPHA * tokens as f64 + (1.0 - EMA_ALPHA) * *value;
    }
}

impl Default for AvgTokensTracker {
    fn default() -> Self {
        // 50 tokens is the "general" classification's estimate, a
        // reasonable prior before any completions have been observed.
        Self::new(50.0)
    }
}

fn expected_completion_secs(candidate: &Candidate, avg_tokens: f64, estimated_tokens: u32, tps: f64) -> f64 {
    if tps <= 0.0 {
        return f64::INFINITY;
    }
    ((candidate.queue_size + candidate.in_flight) as f64 * avg_tokens + estimated_tokens as f64) / tps
}

/// Primary strategy: sample two distinct candidates (weighted by
/// `tps^exponent` unless disabled) and pick whichever has the smaller
/// expected completion time.
pub fn select_power_of_two(
    candidates: &[Candidate],
    classification: &Classification,
    avg_tokens: f64,
    exponent: f64,
    weighted: bool,
) -> Option<Arc<Worker>> {
    if candidates.is_empty() {
        return None;
    }
    if candidates.len() == 1 {
        return Some(candidates[0].worker.clone());
    }

    let mut rng = rand::thread_rng();
    let (i, j) = sample_two_distinct(candidates, weighted, exponent, &mut rng);

    let tps_i = candidates[i].worker.tps();
    let tps_j = candidates[j].worker.tps();
    let t_i = expected_completion_secs(&candidates[i], avg_tokens, classification.estimated_tokens, tps_i);
    let t_j = expected_completion_secs(&candidates[j], avg_tokens, classification.estimated_tokens, tps_j);

    if t_i <= t_j {
        Some(candidates[i].worker.clone())
    } else {
        Some(candidates[j].worker.clone())
    }
}

fn sample_two_distinct(candidates: &[Candidate], weighted: bool, exponent: f64, rng: &mut impl Rng) -> (usize, usize) {
    if !weighted {
        let i = rng.gen_range(0..candidates.len());
        let mut j = rng.gen_range(0..candidates.len() - 1);
        if j >= i {
            j += 1;
        }
        return (i, j);
    }

    let weights: Vec<f64> = candidates
        .iter()
        .map(|c| c.worker.tps().max(0.0).powf(exponent))
        .collect();
    let total: f64 = weights.iter().sum();

    if total <= 0.0 {
        return sample_two_distinct(candidates, false, exponent, rng);
    }

    let i = weighted_pick(&weights, total, rng);
    let remaining_total = total - weights[i];
    let j = if remaining_total <= 0.0 {
        // Degenerate: only one worker has non-zero weight; pick any other.
        (i + 1) % candidates.len()
    } else {
        loop {
            let pick = weighted_pick(&weights, total, rng);
            if pick != i {
                break pick;
            }
        }
    };

    (i, j)
}

fn weighted_pick(weights: &[f64], total: f64, rng: &mut impl Rng) -> usize {
    let mut target = rng.gen_range(0.0..total);
    for (idx, w) in weights.iter().enumerate() {
        if target < *w {
            return idx;
        }
        target -= w;
    }
    weights.len() - 1
}

/// Secondary strategy: rank candidates by descending TPS and prefer a
/// complexity-appropriate position in that ranking.
pub fn select_complexity_routing(candidates: &[Candidate], complexity: Complexity) -> Option<Arc<Worker>> {
    if candidates.is_empty() {
        return None;
    }

    let mut ranked: Vec<&Candidate> = candidates.iter().collect();
    ranked.sort_by(|a, b| b.worker.tps().partial_cmp(&a.worker.tps()).unwrap());

    let preferred_index = match complexity {
        Complexity::Simple => ranked.len() - 1,
        Complexity::High => 0,
        Complexity::Medium => ranked.len() / 2,
    };

    let is_idle = |c: &Candidate| c.queue_size == 0 && c.in_flight == 0;

    if is_idle(ranked[preferred_index]) {
        return Some(ranked[preferred_index].worker.clone());
    }

    if let Some(idle) = ranked.iter().find(|c| is_idle(c)) {
        return Some(idle.worker.clone());
    }

    Some(ranked[preferred_index].worker.clone())
}

/// Fallback when every worker is at or over its limit: pick the worker
/// with the smallest `queueSize / capacity` ratio.
pub fn select_saturation_fallback(all: &[Candidate]) -> Option<Arc<Worker>> {
    all.iter()
        .filter(|c| c.worker.is_online())
        .min_by(|a, b| {
            let ratio = |c: &Candidate| {
                let capacity = c.worker.capacity().max(1) as f64;
                c.queue_size as f64 / capacity
            };
            ratio(a).partial_cmp(&ratio(b)).unwrap()
        })
        .map(|c| c.worker.clone())
}
