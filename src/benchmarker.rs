//! Benchmarker: issues a probe generation request to every worker and
//! derives TPS from the returned timing fields (§4.2).

use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::backend::BackendClient;
use crate::registry::{Registry, Worker};

/// Fixed probe prompt. Deliberately distinct from the classifier's own
/// worked example ("Why is the sky blue?") — this string never reaches the
/// classifier, it only exercises the generation endpoint.
pub const PROBE_PROMPT: &str = "Respond with the single word: ready";

/// Benchmarks a single worker: probes it, derives TPS, and (on success)
/// recomputes capacity/concurrency and refreshes its advertised model list.
pub async fn benchmark_worker(
    worker: &Arc<Worker>,
    backend: &BackendClient,
    tps_per_person: f64,
    target_latency_ms: u64,
) {
    match backend.probe(&worker.id, PROBE_PROMPT).await {
        Ok((tokens, duration_ns)) if duration_ns > 0 => {
            let tps = tokens as f64 / (duration_ns as f64 / 1_000_000_000.0);
            recompute_worker_state(worker, tps, tps_per_person, target_latency_ms);
            info!(worker_id = %worker.id, tps, "benchmark complete");

            if let Ok(models) = backend.list_models(&worker.id).await {
                worker.lock().models = models;
            }
        }
        Ok(_) => {
            warn!(worker_id = %worker.id, "benchmark returned zero duration, marking offline");
            worker.lock().mark_offline();
        }
        Err(err) => {
            warn!(worker_id = %worker.id, error = %err, "benchmark probe failed, marking offline");
            worker.lock().mark_offline();
        }
    }
}

fn recompute_worker_state(worker: &Worker, tps: f64, tps_per_person: f64, target_latency_ms: u64) {
    let mut inner = worker.lock();
    inner.mark_online(tps);
    let profile = inner.profile.profile();
    inner.capacity = crate::placement::derive_capacity(
        tps,
        tps_per_person,
        inner.adaptive_multiplier,
        profile.success_rate,
    );
    inner.max_concurrent =
        crate::placement::derive_max_concurrent(tps, profile.avg_ms, profile.p95_ms, target_latency_ms);
}

/// Benchmarks every registered worker concurrently. Run at startup and
/// whenever `change_model` is invoked.
pub async fn benchmark_all(registry: &Arc<Registry>, backend: &Arc<BackendClient>, tps_per_person: f64, target_latency_ms: u64) {
    let workers = registry.workers();
    let mut set = JoinSet::new();
    for worker in workers {
        let backend = Arc::clone(backend);
        set.spawn(async move {
            benchmark_worker(&worker, &backend, tps_per_person, target_latency_ms).await;
        });
    }
    while set.join_next().await.is_some() {}
}
