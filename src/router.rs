//! Router: the crate's public entry point. Owns the worker registry, the
//! backend client, and the background dispatch/rebalance/health loops, and
//! exposes the request-facing `generate` call plus the control/observability
//! API (§6).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::backend::BackendClient;
use crate::benchmarker;
use crate::classifier::{Classification, ClassifierCache};
use crate::config::{Config, RuntimeKnobs};
use crate::errors::RouterError;
use crate::health;
use crate::placement::{self, AvgTokensTracker};
use crate::profiler::Profile;
use crate::queue::{self, DispatchContext, QueuedRequest};
use crate::rebalancer;
use crate::registry::Registry;
use crate::sentinel::{self, FallbackGenerator, ModelChangeObserver, SentinelFallbackGenerator};
use crate::velocity;

/// Fans a model-change notification out to every registered observer.
/// `BackendClient` only carries a single observer slot (§4.2/§4.11); this
/// wraps that slot so the router's control API can register more than one
/// without changing the backend client's seam.
struct ObserverBroadcast {
    observers: Mutex<Vec<Arc<dyn ModelChangeObserver>>>,
}

impl ObserverBroadcast {
    fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, observer: Arc<dyn ModelChangeObserver>) {
        self.observers.lock().unwrap_or_else(|e| e.into_inner()).push(observer);
    }
}

#[async_trait]
impl ModelChangeObserver for ObserverBroadcast {
    async fn on_model_changed(&self, model: &str, success: bool) {
        let observers = self.observers.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for observer in observers {
            observer.on_model_changed(model, success).await;
        }
    }
}

/// Utilization band derived from a worker's `(queue_size + in_flight) /
/// (capacity + max_concurrent)` ratio. Thresholds are an Open Question the
/// spec leaves to the implementation; see `DESIGN.md`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Healthy,
    Moderate,
    High,
    AtCapacity,
}

impl QueueStatus {
    fn from_utilization_pct(pct: f64) -> Self {
        if pct < 50.0 {
            QueueStatus::Healthy
        } else if pct < 80.0 {
            QueueStatus::Moderate
        } else if pct < 100.0 {
            QueueStatus::High
        } else {
            QueueStatus::AtCapacity
        }
    }
}

/// Snapshot of one worker's queue pressure, for observability.
#[derive(Debug, Clone)]
pub struct QueueHealth {
    pub worker_id: String,
    pub online: bool,
    pub queue_size: usize,
    pub in_flight: usize,
    pub capacity: usize,
    pub max_concurrent: usize,
    pub utilization_pct: f64,
    pub status: QueueStatus,
}

/// A donor/recipient pair the rebalancer would act on at the next tick, had
/// one already fired. Computed read-only for observability.
#[derive(Debug, Clone)]
pub struct PreWarmRecommendation {
    pub donor: String,
    pub recipient: String,
}

/// Result of a successful `change_model` call.
#[derive(Debug, Clone)]
pub struct ModelChangeSummary {
    pub model: String,
    pub workers_online: usize,
}

/// The load-balancing request router. Construct via `Router::bootstrap`.
pub struct Router {
    registry: Arc<Registry>,
    backend: Arc<BackendClient>,
    avg_tokens: Arc<AvgTokensTracker>,
    classifier: ClassifierCache,
    knobs: Arc<Mutex<RuntimeKnobs>>,
    fallback: Arc<dyn FallbackGenerator>,
    observers: Arc<ObserverBroadcast>,
    dispatcher_handles: Mutex<Vec<JoinHandle<()>>>,
    rebalancer_handle: Mutex<Option<JoinHandle<()>>>,
    health_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Router {
    /// Loads `config`, seeds and benchmarks the worker pool, and spawns the
    /// dispatcher/rebalancer/health-monitor background loops. Fails only if
    /// `OLLAMA_REQUIRED` is set and no seeded worker came up online.
    pub async fn bootstrap(config: Config) -> Result<Arc<Self>, RouterError> {
        Self::bootstrap_with_fallback(config, Arc::new(SentinelFallbackGenerator)).await
    }

    /// Same as `bootstrap`, with a caller-supplied fallback generator in
    /// place of the sentinel default (used when no worker is reachable and
    /// `OLLAMA_REQUIRED` is false).
    pub async fn bootstrap_with_fallback(
        config: Config,
        fallback: Arc<dyn FallbackGenerator>,
    ) -> Result<Arc<Self>, RouterError> {
        config.log_summary();

        let registry = Arc::new(Registry::new());
        registry.seed(&config.seed_hosts());

        let built = crate::client::build_client(&config.to_client_config()).map_err(|e| {
            RouterError::Config(crate::config::ConfigError::InvalidValue {
                var: "CUSTOM_HEADERS".to_string(),
                message: e.to_string(),
            })
        })?;

        let observers = Arc::new(ObserverBroadcast::new());
        let backend = Arc::new(
            BackendClient::new(built.client, config.model_candidates())
                .with_observer(observers.clone() as Arc<dyn ModelChangeObserver>),
        );

        let cancellation = crate::cancellation::CancellationManager::new(config.cancellation_timeout_ms);
        let avg_tokens = Arc::new(AvgTokensTracker::default());
        let classifier = ClassifierCache::default();
        let knobs = Arc::new(Mutex::new(config.runtime_knobs()));

        benchmarker::benchmark_all(&registry, &backend, config.tps_per_person, config.target_latency_ms).await;

        if config.ollama_required && registry.online_workers().is_empty() {
            return Err(RouterError::NoWorkersReachable);
        }

        let dispatch_ctx = DispatchContext {
            registry: registry.clone(),
            backend: backend.clone(),
            cancellation,
            avg_tokens: avg_tokens.clone(),
        };
        let dispatcher_handles = registry
            .workers()
            .into_iter()
            .map(|worker| queue::spawn_dispatcher(worker, dispatch_ctx.clone()))
            .collect();

        let rebalancer_handle = rebalancer::spawn_rebalancer(registry.clone(), knobs.clone());
        let health_handle = health::spawn_health_monitor(registry.clone(), backend.clone(), knobs.clone());

        Ok(Arc::new(Self {
            registry,
            backend,
            avg_tokens,
            classifier,
            knobs,
            fallback,
            observers,
            dispatcher_handles: Mutex::new(dispatcher_handles),
            rebalancer_handle: Mutex::new(Some(rebalancer_handle)),
            health_handle: Mutex::new(Some(health_handle)),
        }))
    }

    /// Classifies and routes `prompt` to a worker, or the fallback generator
    /// if none is reachable. Never rejects: always resolves to real text or
    /// one of the stable sentinel strings.
    pub async fn generate(&self, prompt: &str, training_data: Option<&str>, knowledge: Option<&str>) -> String {
        let effective_prompt = compose_prompt(prompt, training_data, knowledge);
        let classification = self.classifier.classify(&effective_prompt);

        match self.place(&classification) {
            Some(worker) => {
                let (request, rx) = QueuedRequest::new(effective_prompt, classification);
                worker.queue.push_back(request);
                rx.await.unwrap_or_else(|_| sentinel::TECHNICAL_DIFFICULTIES.to_string())
            }
            None => self.fallback.generate(&effective_prompt).await,
        }
    }

    /// Primary power-of-two placement, falling through to complexity
    /// routing and then saturation fallback, mirroring the dispatcher's own
    /// `redistribute_queue` chain.
    fn place(&self, classification: &Classification) -> Option<Arc<crate::registry::Worker>> {
        let online = self.registry.online_workers();
        if online.is_empty() {
            return None;
        }

        let candidates: Vec<placement::Candidate> = online
            .iter()
            .map(|w| placement::Candidate {
                worker: Arc::clone(w),
                queue_size: w.queue.len(),
                in_flight: w.queue.in_flight(),
            })
            .collect();

        let knobs = self.knobs_snapshot();
        let primary = if knobs.use_power_of_two {
            placement::select_power_of_two(
                &candidates,
                classification,
                self.avg_tokens.get(),
                knobs.power_of_two_exponent,
                true,
            )
        } else {
            None
        };

        primary
            .or_else(|| placement::select_complexity_routing(&candidates, classification.complexity))
            .or_else(|| placement::select_saturation_fallback(&candidates))
    }

    fn knobs_snapshot(&self) -> RuntimeKnobs {
        *self.knobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Model names reported by any currently online worker.
    pub fn available_models(&self) -> Vec<String> {
        self.registry.available_models()
    }

    /// Switches the active model, re-benchmarks every worker against it, and
    /// notifies registered model-change observers. Fails if no worker comes
    /// back online under the new model.
    pub async fn change_model(&self, name: &str) -> Result<ModelChangeSummary, RouterError> {
        self.backend.set_model(name).await;

        let (tps_per_person, target_latency_ms) = {
            let knobs = self.knobs_snapshot();
            (knobs.tps_per_person, knobs.target_latency_ms)
        };
        benchmarker::benchmark_all(&self.registry, &self.backend, tps_per_person, target_latency_ms).await;

        let workers_online = self.registry.online_workers().len();
        let success = workers_online > 0;
        self.observers.on_model_changed(name, success).await;

        if success {
            Ok(ModelChangeSummary {
                model: name.to_string(),
                workers_online,
            })
        } else {
            Err(RouterError::ModelChangeFailed { model: name.to_string() })
        }
    }

    /// Registers an additional model-change observer alongside any already
    /// wired in.
    pub fn add_model_change_observer(&self, observer: Arc<dyn ModelChangeObserver>) {
        self.observers.register(observer);
    }

    /// Per-worker queue depth, capacity, and utilization band.
    pub fn queue_health(&self) -> Vec<QueueHealth> {
        self.registry
            .workers()
            .iter()
            .map(|w| {
                let queue_size = w.queue.len();
                let in_flight = w.queue.in_flight();
                let capacity = w.capacity();
                let max_concurrent = w.max_concurrent();
                let denom = (capacity + max_concurrent).max(1) as f64;
                let utilization_pct = (queue_size + in_flight) as f64 / denom * 100.0;
                QueueHealth {
                    worker_id: w.id.clone(),
                    online: w.is_online(),
                    queue_size,
                    in_flight,
                    capacity,
                    max_concurrent,
                    utilization_pct,
                    status: QueueStatus::from_utilization_pct(utilization_pct),
                }
            })
            .collect()
    }

    /// Per-worker rolling completion-time profile.
    pub fn profiles(&self) -> Vec<(String, Profile)> {
        self.registry
            .workers()
            .iter()
            .map(|w| (w.id.clone(), w.lock().profile.profile()))
            .collect()
    }

    /// Per-worker current queue-growth velocity, items/sec.
    pub fn velocities(&self) -> Vec<(String, f64)> {
        self.registry
            .workers()
            .iter()
            .map(|w| (w.id.clone(), w.lock().velocity.velocity()))
            .collect()
    }

    /// Donor/recipient pairs that qualify for a pre-warm move right now,
    /// computed read-only (the rebalancer tick performs the actual move).
    pub fn pre_warm_recommendations(&self) -> Vec<PreWarmRecommendation> {
        let threshold = self.knobs_snapshot().pre_warm_threshold;
        let workers = self.registry.online_workers();
        let mut recommendations = Vec::new();

        for donor in &workers {
            let queue_size = donor.queue.len();
            let capacity = donor.capacity();
            let qualifies = donor.lock().velocity.is_pre_warm_donor(queue_size, capacity, threshold);
            if !qualifies {
                continue;
            }
            if let Some(recipient) = workers
                .iter()
                .find(|w| w.id != donor.id && velocity::is_recipient_candidate(w.queue.len(), w.capacity()))
            {
                recommendations.push(PreWarmRecommendation {
                    donor: donor.id.clone(),
                    recipient: recipient.id.clone(),
                });
            }
        }

        recommendations
    }

    pub fn strategy_name(&self) -> &'static str {
        if self.knobs_snapshot().use_power_of_two {
            "power_of_two"
        } else {
            "complexity_routing"
        }
    }

    pub fn advanced_features_enabled(&self) -> bool {
        self.knobs_snapshot().use_power_of_two
    }

    pub fn set_use_power_of_two(&self, enabled: bool) {
        self.knobs.lock().unwrap_or_else(|e| e.into_inner()).use_power_of_two = enabled;
    }

    pub fn set_pre_warm_threshold(&self, value: f64) {
        self.knobs.lock().unwrap_or_else(|e| e.into_inner()).pre_warm_threshold = value;
    }

    pub fn set_power_of_two_exponent(&self, value: f64) {
        self.knobs.lock().unwrap_or_else(|e| e.into_inner()).power_of_two_exponent = value;
    }

    pub fn set_tps_per_person(&self, value: f64) {
        self.knobs.lock().unwrap_or_else(|e| e.into_inner()).tps_per_person = value;
    }

    pub fn set_target_latency_ms(&self, value: u64) {
        self.knobs.lock().unwrap_or_else(|e| e.into_inner()).target_latency_ms = value;
    }

    /// Aborts the dispatcher/rebalancer/health-monitor background tasks.
    /// Idempotent: a second call is a no-op.
    pub fn shutdown(&self) {
        if let Some(handle) = self.rebalancer_handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        if let Some(handle) = self.health_handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        for handle in self.dispatcher_handles.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            handle.abort();
        }
    }
}

fn compose_prompt(prompt: &str, training_data: Option<&str>, knowledge: Option<&str>) -> String {
    let mut sections = Vec::new();
    if let Some(knowledge) = knowledge.filter(|s| !s.is_empty()) {
        sections.push(format!("Context:\n{}", knowledge));
    }
    if let Some(training_data) = training_data.filter(|s| !s.is_empty()) {
        sections.push(format!("Reference:\n{}", training_data));
    }
    sections.push(prompt.to_string());
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_worker(mock_server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [{"name": "llama3"}]
            })))
            .mount(mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "response": "ready",
                "eval_count": 10,
                "eval_duration": 100_000_000u64,
            })))
            .mount(mock_server)
            .await;
    }

    #[tokio::test]
    async fn bootstrap_and_generate_routes_to_online_worker() {
        let mock_server = MockServer::start().await;
        mount_worker(&mock_server).await;

        let mut config = Config::for_testing();
        config.ollama_hosts = vec![mock_server.uri()];

        let router = Router::bootstrap(config).await.unwrap();
        let answer = router
            .generate("Tell me a story about a dragon and a knight", None, None)
            .await;
        assert_eq!(answer, "ready");
        router.shutdown();
    }

    #[tokio::test]
    async fn generate_composes_training_data_and_knowledge_into_the_prompt() {
        let mock_server = MockServer::start().await;
        mount_worker(&mock_server).await;

        let mut config = Config::for_testing();
        config.ollama_hosts = vec![mock_server.uri()];

        let router = Router::bootstrap(config).await.unwrap();
        let answer = router
            .generate("What is the capital?", Some("France facts"), Some("Paris is the capital"))
            .await;
        assert_eq!(answer, "ready");
        router.shutdown();
    }

    #[tokio::test]
    async fn no_reachable_workers_uses_fallback_generator() {
        let config = Config::for_testing();
        let router = Router::bootstrap(config).await.unwrap();
        let answer = router.generate("hello", None, None).await;
        assert_eq!(answer, sentinel::STILL_LEARNING);
        router.shutdown();
    }

    #[tokio::test]
    async fn ollama_required_with_no_workers_errors() {
        let mut config = Config::for_testing();
        config.ollama_required = true;
        let result = Router::bootstrap(config).await;
        assert!(matches!(result, Err(RouterError::NoWorkersReachable)));
    }

    #[tokio::test]
    async fn change_model_reports_success_and_notifies_observers() {
        let mock_server = MockServer::start().await;
        mount_worker(&mock_server).await;

        let mut config = Config::for_testing();
        config.ollama_hosts = vec![mock_server.uri()];
        let router = Router::bootstrap(config).await.unwrap();

        struct Recorder(Mutex<Vec<(String, bool)>>);
        #[async_trait]
        impl ModelChangeObserver for Recorder {
            async fn on_model_changed(&self, model: &str, success: bool) {
                self.0.lock().unwrap().push((model.to_string(), success));
            }
        }
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        router.add_model_change_observer(recorder.clone() as Arc<dyn ModelChangeObserver>);

        let summary = router.change_model("mistral").await.unwrap();
        assert_eq!(summary.model, "mistral");
        assert!(summary.workers_online >= 1);
        assert_eq!(recorder.0.lock().unwrap()[0], ("mistral".to_string(), true));
        router.shutdown();
    }

    #[tokio::test]
    async fn queue_health_reports_healthy_band_for_idle_online_worker() {
        let mock_server = MockServer::start().await;
        mount_worker(&mock_server).await;

        let mut config = Config::for_testing();
        config.ollama_hosts = vec![mock_server.uri()];
        let router = Router::bootstrap(config).await.unwrap();

        let health = router.queue_health();
        let online = health.iter().find(|h| h.online).expect("one online worker");
        assert_eq!(online.status, QueueStatus::Healthy);
        assert_eq!(online.queue_size, 0);
        router.shutdown();
    }

    #[tokio::test]
    async fn strategy_name_reflects_use_power_of_two_toggle() {
        let config = Config::for_testing();
        let router = Router::bootstrap(config).await.unwrap();
        assert_eq!(router.strategy_name(), "power_of_two");
        router.set_use_power_of_two(false);
        assert_eq!(router.strategy_name(), "complexity_routing");
        router.shutdown();
    }
}
