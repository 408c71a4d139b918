//! Cancellation Manager: arms a per-request deadline timer on dispatch and
//! aborts the in-flight HTTP call if it fires before the request completes
//! (§4.8).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::backend::AbortSignal;

const MIN_TIMEOUT_MS: u64 = 5000;
const MAX_TIMEOUT_MS: u64 = 60000;
pub const DEFAULT_TIMEOUT_MS: u64 = 15000;

/// Clamps a configured cancellation timeout into `[5000, 60000]` ms.
pub fn clamp_timeout_ms(timeout_ms: u64) -> u64 {
    timeout_ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS)
}

struct Handle {
    worker_id: String,
    abort_tx: Option<oneshot::Sender<()>>,
    timer: JoinHandle<()>,
}

/// Tracks in-flight requests' deadlines and fires an abort signal when one
/// expires without a matching `disarm`.
pub struct CancellationManager {
    handles: Mutex<HashMap<u64, Handle>>,
    timeout: Duration,
}

impl CancellationManager {
    pub fn new(timeout_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            handles: Mutex::new(HashMap::new()),
            timeout: Duration::from_millis(clamp_timeout_ms(timeout_ms)),
        })
    }

    /// Registers `request_id` against `worker_id` and arms the deadline
    /// timer, returning the `AbortSignal` the Backend Client should race
    /// its HTTP call against.
    pub fn register(self: &Arc<Self>, request_id: u64, worker_id: String) -> AbortSignal {
        let (tx, rx) = oneshot::channel();
        let this = Arc::clone(self);
        let timeout = this.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.fire(request_id);
        });

        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.insert(
            request_id,
            Handle {
                worker_id,
                abort_tx: Some(tx),
                timer,
            },
        );
        rx
    }

    fn fire(&self, request_id: u64) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut handle) = handles.remove(&request_id) {
            debug!(request_id, worker_id = %handle.worker_id, "cancellation deadline fired");
            if let Some(tx) = handle.abort_tx.take() {
                let _ = tx.send(());
            }
        }
    }

    /// Disarms the deadline timer for a request that completed normally,
    /// before the timer could fire.
    pub fn disarm(&self, request_id: u64) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = handles.remove(&request_id) {
            handle.timer.abort();
        }
    }

    /// Number of requests currently tracked for cancellation. Exposed for
    /// observability and tests.
    pub fn active_count(&self) -> usize {
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Duration as TokioDuration};

    #[test]
    fn clamp_floors_low_values() {
        assert_eq!(clamp_timeout_ms(100), MIN_TIMEOUT_MS);
    }

    #[test]
    fn clamp_ceils_high_values() {
        assert_eq!(clamp_timeout_ms(999_999), MAX_TIMEOUT_MS);
    }

    #[test]
    fn clamp_passes_through_in_range() {
        assert_eq!(clamp_timeout_ms(20_000), 20_000);
    }

    #[tokio::test]
    async fn disarm_before_fire_prevents_abort() {
        let manager = CancellationManager::new(60_000);
        let mut abort_rx = manager.register(1, "worker-a".to_string());
        manager.disarm(1);
        // Give the aborted timer task a chance to actually stop.
        sleep(TokioDuration::from_millis(10)).await;
        assert_eq!(manager.active_count(), 0);
        assert!(abort_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fire_sends_abort_signal() {
        let manager = CancellationManager::new(MIN_TIMEOUT_MS);
        let mut abort_rx = manager.register(2, "worker-a".to_string());
        manager.fire(2);
        let result = abort_rx.try_recv();
        assert!(result.is_ok());
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn timer_actually_fires_after_timeout() {
        // Use the floor timeout is too long for a test; exercise `fire`
        // directly above and just check registration bookkeeping here.
        let manager = CancellationManager::new(MIN_TIMEOUT_MS);
        let _abort_rx = manager.register(3, "worker-a".to_string());
        assert_eq!(manager.active_count(), 1);
        manager.disarm(3);
        assert_eq!(manager.active_count(), 0);
    }
}
