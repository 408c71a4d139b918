//! Worker Registry: discovers, canonicalizes, and tracks the pool of
//! backend workers (§4.1).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::profiler::Profiler;
use crate::queue::WorkerQueue;
use crate::velocity::VelocityTracker;

/// Online/offline state of a worker. A worker is `Online` iff its most
/// recent probe or completion produced `tps > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Online,
    Offline,
}

/// A worker's mutable state, guarded by a single per-worker `Mutex`.
pub struct WorkerInner {
    pub state: WorkerState,
    pub tps: f64,
    pub capacity: usize,
    pub max_concurrent: usize,
    pub adaptive_multiplier: f64,
    /// Models this worker reported as available via `/api/tags`.
    pub models: Vec<String>,
    pub profile: Profiler,
    pub velocity: VelocityTracker,
}

impl WorkerInner {
    fn new() -> Self {
        Self {
            state: WorkerState::Offline,
            tps: 0.0,
            capacity: 0,
            max_concurrent: 1,
            adaptive_multiplier: 1.0,
            models: Vec::new(),
            profile: Profiler::new(),
            velocity: VelocityTracker::new(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == WorkerState::Online
    }

    /// Marks the worker offline, per the invariant that an offline worker
    /// always has `tps = 0` and `capacity = 0`.
    pub fn mark_offline(&mut self) {
        self.state = WorkerState::Offline;
        self.tps = 0.0;
        self.capacity = 0;
    }

    pub fn mark_online(&mut self, tps: f64) {
        self.state = WorkerState::Online;
        self.tps = tps;
    }
}

impl Default for WorkerInner {
    fn default() -> Self {
        Self::new()
    }
}

/// One backend worker: its canonical endpoint, its dispatch queue, and its
/// mutable telemetry/placement state.
pub struct Worker {
    pub id: String,
    pub queue: WorkerQueue,
    inner: Mutex<WorkerInner>,
}

impl Worker {
    fn new(id: String) -> Self {
        Self {
            id,
            queue: WorkerQueue::new(),
            inner: Mutex::new(WorkerInner::new()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, WorkerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_online(&self) -> bool {
        self.lock().is_online()
    }

    pub fn tps(&self) -> f64 {
        self.lock().tps
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    pub fn max_concurrent(&self) -> usize {
        self.lock().max_concurrent
    }
}

/// Canonicalizes a host string: prepend `http://` if no scheme is given,
/// append the default Ollama port if no port is given, strip a trailing
/// slash.
pub fn canonicalize_host(host: &str) -> String {
    let mut host = host.trim().to_string();
    if host.is_empty() {
        return host;
    }

    if !host.starts_with("http://") && !host.starts_with("https://") {
        host = format!("http://{}", host);
    }

    while host.ends_with('/') {
        host.pop();
    }

    let scheme_end = host.find("://").map(|i| i + 3).unwrap_or(0);
    let authority = &host[scheme_end..];
    if !authority.contains(':') {
        host.push_str(":11434");
    }

    host
}

/// Tracks the live set of backend workers, keyed by canonical id.
///
/// Reads (placement candidate scans, rebalance snapshots) take a brief read
/// lock; structural changes (worker add/remove) take the write lock.
/// Per-worker mutation goes through `Worker::lock()` and never touches the
/// registry lock at all.
pub struct Registry {
    workers: RwLock<HashMap<String, Arc<Worker>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Ensures a worker exists for each of `hosts`, canonicalizing and
    /// deduplicating. Returns the resulting worker set in insertion order.
    pub fn seed(&self, hosts: &[String]) -> Vec<Arc<Worker>> {
        let mut result = Vec::new();
        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        for host in hosts {
            let id = canonicalize_host(host);
            if id.is_empty() {
                continue;
            }
            let worker = workers
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Worker::new(id)))
                .clone();
            if !result.iter().any(|w: &Arc<Worker>| w.id == worker.id) {
                result.push(worker);
            }
        }
        result
    }

    pub fn get(&self, id: &str) -> Option<Arc<Worker>> {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Snapshot of every registered worker.
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Snapshot of currently online workers.
    pub fn online_workers(&self) -> Vec<Arc<Worker>> {
        self.workers().into_iter().filter(|w| w.is_online()).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All model names any online worker reported as available, sorted and
    /// deduplicated (§6, `availableModels()`).
    pub fn available_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self
            .online_workers()
            .iter()
            .flat_map(|w| w.lock().models.clone())
            .collect();
        models.sort();
        models.dedup();
        models
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_adds_scheme_and_port() {
        assert_eq!(canonicalize_host("example.com"), "http://example.com:11434");
    }

    #[test]
    fn canonicalize_preserves_existing_scheme() {
        assert_eq!(
            canonicalize_host("https://example.com"),
            "https://example.com:11434"
        );
    }

    #[test]
    fn canonicalize_preserves_existing_port() {
        assert_eq!(
            canonicalize_host("http://example.com:8080"),
            "http://example.com:8080"
        );
    }

    #[test]
    fn canonicalize_strips_trailing_slash() {
        assert_eq!(
            canonicalize_host("http://example.com:11434/"),
            "http://example.com:11434"
        );
    }

    #[test]
    fn registry_seed_deduplicates() {
        let registry = Registry::new();
        let workers = registry.seed(&[
            "localhost".to_string(),
            "http://localhost:11434".to_string(),
            "http://localhost:11434/".to_string(),
        ]);
        assert_eq!(workers.len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registry_seed_keeps_distinct_hosts() {
        let registry = Registry::new();
        let workers = registry.seed(&["host-a".to_string(), "host-b".to_string()]);
        assert_eq!(workers.len(), 2);
    }

    #[test]
    fn worker_starts_offline_with_zero_capacity() {
        let registry = Registry::new();
        let workers = registry.seed(&["host-a".to_string()]);
        let worker = &workers[0];
        assert!(!worker.is_online());
        assert_eq!(worker.capacity(), 0);
        assert_eq!(worker.tps(), 0.0);
    }

    #[test]
    fn mark_online_then_offline_resets_capacity() {
        let registry = Registry::new();
        let workers = registry.seed(&["host-a".to_string()]);
        let worker = &workers[0];
        {
            let mut inner = worker.lock();
            inner.mark_online(250.0);
            inner.capacity = 5;
        }
        assert!(worker.is_online());
        worker.lock().mark_offline();
        assert!(!worker.is_online());
        assert_eq!(worker.capacity(), 0);
        assert_eq!(worker.tps(), 0.0);
    }

    #[test]
    fn available_models_only_from_online_workers() {
        let registry = Registry::new();
        let workers = registry.seed(&["host-a".to_string(), "host-b".to_string()]);
        workers[0].lock().mark_online(100.0);
        workers[0].lock().models = vec!["llama3".to_string(), "phi3".to_string()];
        // host-b stays offline.
        workers[1].lock().models = vec!["mistral".to_string()];

        assert_eq!(
            registry.available_models(),
            vec!["llama3".to_string(), "phi3".to_string()]
        );
    }
}
