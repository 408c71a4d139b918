use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{
    Encoder, GaugeVec, HistogramVec, IntCounterVec, Opts, Registry as PromRegistry, TextEncoder,
};
use std::env;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "inference_router".to_string());

    // === Per-worker state ===

    pub static ref WORKER_QUEUE_SIZE: GaugeVec =
        GaugeVec::new(
            Opts::new("worker_queue_size", "Current queue depth for a worker")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["worker_id"]
        ).unwrap();

    pub static ref WORKER_IN_FLIGHT: GaugeVec =
        GaugeVec::new(
            Opts::new("worker_in_flight", "Current in-flight request count for a worker")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["worker_id"]
        ).unwrap();

    pub static ref WORKER_TPS: GaugeVec =
        GaugeVec::new(
            Opts::new("worker_tps", "Most recently measured tokens/sec for a worker")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["worker_id"]
        ).unwrap();

    pub static ref WORKER_ONLINE: GaugeVec =
        GaugeVec::new(
            Opts::new("worker_online", "1 if the worker is Online, 0 if Offline")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["worker_id"]
        ).unwrap();

    // === Dispatch outcomes ===

    pub static ref DISPATCH_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("dispatch_total", "Total dispatches per worker and outcome")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["worker_id", "outcome"] // outcome: success, failure, cancelled
        ).unwrap();

    pub static ref DISPATCH_DURATION_SECONDS: HistogramVec =
        HistogramVec::new(
            prometheus::HistogramOpts::new(
                "dispatch_duration_seconds",
                "Completion latency per worker in seconds"
            ).namespace(METRIC_NAMESPACE.as_str()),
            &["worker_id"]
        ).unwrap();

    // === Error taxonomy (§7) ===

    pub static ref BACKEND_ERRORS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("backend_errors_total", "Backend invocation errors by category")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["category"]
        ).unwrap();

    // === Cancellation / rebalancing ===

    pub static ref CANCELLATIONS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("cancellations_total", "Deadline-triggered cancellations by resolution")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["resolution"] // resolution: rerouted, timeout_sentinel
        ).unwrap();

    pub static ref REBALANCE_MOVES_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("rebalance_moves_total", "Items moved between worker queues")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["reason"] // reason: idle_steal, pre_warm, redistribution
        ).unwrap();

    // === Model lifecycle ===

    pub static ref MODEL_CHANGES_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("model_changes_total", "Model rotation/change attempts")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["result"] // result: success, failure
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    prometheus::default_registry().register(Box::new(WORKER_QUEUE_SIZE.clone()))?;
    prometheus::default_registry().register(Box::new(WORKER_IN_FLIGHT.clone()))?;
    prometheus::default_registry().register(Box::new(WORKER_TPS.clone()))?;
    prometheus::default_registry().register(Box::new(WORKER_ONLINE.clone()))?;
    prometheus::default_registry().register(Box::new(DISPATCH_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(DISPATCH_DURATION_SECONDS.clone()))?;
    prometheus::default_registry().register(Box::new(BACKEND_ERRORS_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(CANCELLATIONS_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(REBALANCE_MOVES_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(MODEL_CHANGES_TOTAL.clone()))?;
    Ok(())
}

/// Snapshots every worker's queue/in-flight/tps/online gauges. Called
/// periodically (e.g. by the rebalancer tick) rather than on every
/// placement, since these are presentation-layer metrics, not the
/// authoritative state.
pub fn record_worker_snapshot(registry: &crate::registry::Registry) {
    for worker in registry.workers() {
        let inner = worker.lock();
        WORKER_QUEUE_SIZE
            .with_label_values(&[&worker.id])
            .set(worker.queue.len() as f64);
        WORKER_IN_FLIGHT
            .with_label_values(&[&worker.id])
            .set(worker.queue.in_flight() as f64);
        WORKER_TPS.with_label_values(&[&worker.id]).set(inner.tps);
        WORKER_ONLINE
            .with_label_values(&[&worker.id])
            .set(if inner.is_online() { 1.0 } else { 0.0 });
    }
}

/// HTTP handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(
    _req: Request<Body>,
    registry: Arc<Mutex<PromRegistry>>,
) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.lock().unwrap().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();

    let response = Response::builder()
        .status(200)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap();

    Ok(response)
}

/// Starts the Prometheus metrics HTTP server.
pub async fn start_metrics_server(port: u16, registry: Arc<Mutex<PromRegistry>>) {
    let addr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| {
        let registry_clone = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let registry_clone_inner = registry_clone.clone();
                async move { metrics_handler(req, registry_clone_inner).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(port = port, addr = %addr, "metrics server listening");

    if let Err(e) = server.await {
        error!(error = %e, "metrics server error");
    }
}

/// Gathers and encodes metrics as a string, used by tests and CLI dumps.
pub fn gather_metrics_string(registry: &Arc<Mutex<PromRegistry>>) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.lock().unwrap().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap_or_else(|e| {
        eprintln!("error encoding metrics to UTF-8: {}", e);
        String::from("# ERROR ENCODING METRICS TO UTF-8")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_snapshot_populates_gauges() {
        let registry = crate::registry::Registry::new();
        let workers = registry.seed(&["metrics-test-host".to_string()]);
        let worker_id = workers[0].id.clone();
        workers[0].lock().mark_online(250.0);

        record_worker_snapshot(&registry);

        assert_eq!(WORKER_TPS.with_label_values(&[&worker_id]).get(), 250.0);
        assert_eq!(WORKER_ONLINE.with_label_values(&[&worker_id]).get(), 1.0);
    }

    #[test]
    fn dispatch_counter_increments_by_label() {
        DISPATCH_TOTAL.with_label_values(&["worker-a", "success"]).inc();
        assert!(DISPATCH_TOTAL.with_label_values(&["worker-a", "success"]).get() >= 1);
    }
}
