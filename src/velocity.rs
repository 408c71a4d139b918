//! Velocity Tracker & Pre-Warmer: tracks each worker's queue-growth rate and
//! flags pre-warm donor/recipient pairs for the rebalancer (§4.7).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(5);
const MIN_DELTA_SECS: f64 = 0.5;

/// Default threshold, items/sec, above which a worker is considered to be
/// growing fast enough to pre-warm a recipient for.
pub const DEFAULT_PRE_WARM_THRESHOLD: f64 = 2.0;

/// Projected time-to-full horizon used to qualify a donor (§4.7).
const TIME_TO_FULL_HORIZON_SECS: f64 = 5.0;

/// Recipients must be under this fraction of capacity utilization.
const RECIPIENT_UTILIZATION_CEILING: f64 = 0.3;

/// Maximum items moved per donor/recipient pair during pre-warming.
pub const MAX_PRE_WARM_MOVE: usize = 2;

/// Rolling 5-second history of `(time, queueSize)` samples for one worker,
/// used to derive its current velocity (signed items/sec).
pub struct VelocityTracker {
    samples: VecDeque<(Instant, usize)>,
}

impl VelocityTracker {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
        }
    }

    /// Records the current queue size, pruning samples older than the
    /// 5-second window.
    pub fn record(&mut self, queue_size: usize) {
        let now = Instant::now();
        self.samples.push_back((now, queue_size));
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Signed items/sec growth rate over the current window. Zero if fewer
    /// than two samples exist or the elapsed delta is under 0.5s.
    pub fn velocity(&self) -> f64 {
        let (Some(&(t_old, size_old)), Some(&(t_new, size_new))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let delta = t_new.duration_since(t_old).as_secs_f64();
        if delta < MIN_DELTA_SECS {
            return 0.0;
        }
        (size_new as f64 - size_old as f64) / delta
    }

    /// Whether this worker is growing fast enough, and close enough to
    /// full, to qualify as a pre-warm donor.
    pub fn is_pre_warm_donor(&self, queue_size: usize, capacity: usize, threshold: f64) -> bool {
        let velocity = self.velocity();
        if velocity <= threshold {
            return false;
        }
        let remaining = capacity as f64 - queue_size as f64;
        if remaining <= 0.0 {
            return true;
        }
        let time_to_full = remaining / velocity;
        time_to_full < TIME_TO_FULL_HORIZON_SECS
    }
}

impl Default for VelocityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a worker is under-utilized enough to receive a pre-warm move.
pub fn is_recipient_candidate(queue_size: usize, capacity: usize) -> bool {
    if capacity == 0 {
        return false;
    }
    (queue_size as f64 / capacity as f64) < RECIPIENT_UTILIZATION_CEILING
}
