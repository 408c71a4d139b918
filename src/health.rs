//! Health Monitor: periodically probes offline workers and re-admits them
//! once they respond again (§4.10).

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::backend::BackendClient;
use crate::config::RuntimeKnobs;
use crate::registry::Registry;

const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Spawns the periodic health-check loop over offline workers. Reads
/// `tps_per_person`/`target_latency_ms` fresh from `knobs` each tick so the
/// control API can adjust them without restarting the loop.
pub fn spawn_health_monitor(
    registry: Arc<Registry>,
    backend: Arc<BackendClient>,
    knobs: Arc<Mutex<RuntimeKnobs>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            interval.tick().await;
            let (tps_per_person, target_latency_ms) = {
                let k = knobs.lock().unwrap_or_else(|e| e.into_inner());
                (k.tps_per_person, k.target_latency_ms)
            };
            tick(&registry, &backend, tps_per_person, target_latency_ms).await;
        }
    })
}

async fn tick(registry: &Registry, backend: &BackendClient, tps_per_person: f64, target_latency_ms: u64) {
    let offline: Vec<_> = registry.workers().into_iter().filter(|w| !w.is_online()).collect();

    for worker in offline {
        if backend.list_models(&worker.id).await.is_err() {
            continue; // still unreachable, deferred to the next tick
        }

        crate::benchmarker::benchmark_worker(&worker, backend, tps_per_person, target_latency_ms).await;
        if worker.is_online() {
            info!(worker_id = %worker.id, "worker reconnected, readmitted to the pool");
        }
    }
}
