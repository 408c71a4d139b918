//! Per-Worker Queue & Dispatcher: a bounded-by-capacity queue and a
//! concurrency-limited dispatch loop for one worker (§4.5).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

use crate::backend::BackendClient;
use crate::cancellation::CancellationManager;
use crate::classifier::Classification;
use crate::placement::AvgTokensTracker;
use crate::registry::{Registry, Worker};
use crate::sentinel;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// One admitted request, owned by exactly one place (a worker's queue, a
/// dispatcher's in-flight slot, or mid-reroute) at any instant. Not
/// `Clone`: ownership moves by value, which is what makes "at most one
/// queue or in-flight set" an invariant the type system helps enforce.
pub struct QueuedRequest {
    pub id: u64,
    pub prompt: String,
    pub classification: Classification,
    pub completion: oneshot::Sender<String>,
    pub enqueued_at: Instant,
}

impl QueuedRequest {
    pub fn new(prompt: String, classification: Classification) -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                id: next_request_id(),
                prompt,
                classification,
                completion: tx,
                enqueued_at: Instant::now(),
            },
            rx,
        )
    }

    /// Resolves the request's completion sink. The router never rejects,
    /// so this is infallible from the caller's perspective; if the
    /// receiver was already dropped (client gone), the send is a no-op.
    pub fn resolve(self, text: String) {
        let _ = self.completion.send(text);
    }
}

/// A worker's FIFO queue plus its concurrency-limited in-flight counter.
/// Pushed at the tail by placement and the rebalancer's recipient side;
/// popped at the head by the dispatcher, at the tail by the rebalancer's
/// donor side.
pub struct WorkerQueue {
    queue: Mutex<VecDeque<QueuedRequest>>,
    in_flight: AtomicUsize,
    notify: Notify,
}

impl WorkerQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            in_flight: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    pub fn push_back(&self, request: QueuedRequest) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).push_back(request);
        self.notify.notify_one();
    }

    pub fn pop_front(&self) -> Option<QueuedRequest> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    pub fn pop_back(&self) -> Option<QueuedRequest> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_back()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }

    async fn wait_for_work(&self) {
        self.notify.notified().await;
    }
}

impl Default for WorkerQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared context every per-worker dispatcher loop needs.
#[derive(Clone)]
pub struct DispatchContext {
    pub registry: Arc<Registry>,
    pub backend: Arc<BackendClient>,
    pub cancellation: Arc<CancellationManager>,
    pub avg_tokens: Arc<AvgTokensTracker>,
}

/// Spawns the dispatch loop for `worker`. Runs for the lifetime of the
/// router; parks on the queue's `Notify` instead of busy-polling when
/// there's nothing to do.
pub fn spawn_dispatcher(worker: Arc<Worker>, ctx: DispatchContext) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            dispatch_available(&worker, &ctx).await;
            worker.queue.wait_for_work().await;
        }
    })
}

/// Pops and launches as many requests as the worker's current concurrency
/// headroom allows. Each launch schedules its own follow-up attempt so
/// concurrency fills back up to the limit as slots free up.
async fn dispatch_available(worker: &Arc<Worker>, ctx: &DispatchContext) {
    loop {
        let max_concurrent = worker.max_concurrent();
        if worker.queue.in_flight() >= max_concurrent {
            return;
        }
        let Some(request) = worker.queue.pop_front() else {
            return;
        };

        worker.queue.in_flight.fetch_add(1, Ordering::AcqRel);
        let worker = Arc::clone(worker);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            run_one(worker, ctx, request).await;
        });
    }
}

async fn run_one(worker: Arc<Worker>, ctx: DispatchContext, request: QueuedRequest) {
    let request_id = request.id;
    let estimated_tokens = request.classification.estimated_tokens;
    let abort = ctx.cancellation.register(request_id, worker.id.clone());

    let result = ctx
        .backend
        .generate(&worker.id, &request.prompt, estimated_tokens, abort)
        .await;
    ctx.cancellation.disarm(request_id);

    worker.queue.in_flight.fetch_sub(1, Ordering::AcqRel);

    match result {
        Ok(outcome) => {
            ctx.avg_tokens.record(outcome.tokens);
            {
                let mut inner = worker.lock();
                inner.profile.record(outcome.duration_ms, outcome.tokens, true);
                if outcome.duration_ms > 0 {
                    let instantaneous_tps = outcome.tokens as f64 / (outcome.duration_ms as f64 / 1000.0);
                    inner.tps =
                        crate::placement::EMA_ALPHA * instantaneous_tps + (1.0 - crate::placement::EMA_ALPHA) * inner.tps;
                }
            }
            request.resolve(outcome.text);
        }
        Err(err) => {
            handle_failure(&worker, &ctx, request, err).await;
        }
    }

    on_worker_activity_settled(&worker, &ctx).await;
}

async fn handle_failure(
    worker: &Arc<Worker>,
    ctx: &DispatchContext,
    request: QueuedRequest,
    err: crate::errors::BackendError,
) {
    use crate::errors::BackendError;

    worker.lock().profile.record(0, 0, false);

    match err {
        BackendError::Cancelled { .. } => {
            reroute_or_timeout_sentinel(ctx, &worker.id, request).await;
        }
        BackendError::Transport { .. } | BackendError::Http { .. } => {
            warn!(worker_id = %worker.id, "backend invocation failed, marking worker offline");
            worker.lock().mark_offline();
            redistribute_queue(worker, ctx).await;
            request.resolve(sentinel::STILL_LEARNING.to_string());
        }
        BackendError::MalformedResponse { .. } => {
            request.resolve(sentinel::INSUFFICIENT_INFORMATION.to_string());
        }
    }
}

/// On timeout, re-route once to the fastest other online worker; if none
/// exists, resolve with the timeout sentinel (§4.8).
async fn reroute_or_timeout_sentinel(ctx: &DispatchContext, current_worker_id: &str, request: QueuedRequest) {
    let candidates = ctx.registry.online_workers();
    let best = candidates
        .iter()
        .filter(|w| w.id != current_worker_id)
        .max_by(|a, b| a.tps().partial_cmp(&b.tps()).unwrap());

    match best {
        Some(target) => {
            debug!(request_id = request.id, target = %target.id, "re-routing cancelled request");
            target.queue.push_back(request);
        }
        None => {
            request.resolve(sentinel::TAKING_TOO_LONG.to_string());
        }
    }
}

/// Drains a failed worker's queue and re-places each item among the
/// remaining online workers; resolves with a sentinel if none remain.
async fn redistribute_queue(worker: &Arc<Worker>, ctx: &DispatchContext) {
    let mut drained = Vec::new();
    while let Some(request) = worker.queue.pop_front() {
        drained.push(request);
    }
    if drained.is_empty() {
        return;
    }

    let online = ctx.registry.online_workers();
    if online.is_empty() {
        for request in drained {
            request.resolve(sentinel::TECHNICAL_DIFFICULTIES.to_string());
        }
        return;
    }

    info!(worker_id = %worker.id, count = drained.len(), "redistributing queue after worker loss");
    for request in drained {
        let candidates: Vec<crate::placement::Candidate> = online
            .iter()
            .map(|w| crate::placement::Candidate {
                worker: Arc::clone(w),
                queue_size: w.queue.len(),
                in_flight: w.queue.in_flight(),
            })
            .collect();
        let target = crate::placement::select_power_of_two(
            &candidates,
            &request.classification,
            ctx.avg_tokens.get(),
            1.5,
            true,
        )
        .or_else(|| crate::placement::select_saturation_fallback(&candidates));

        match target {
            Some(worker) => worker.queue.push_back(request),
            None => request.resolve(sentinel::TECHNICAL_DIFFICULTIES.to_string()),
        }
    }
}

/// Invoked after every completion. If the worker's queue just drained to
/// empty with nothing in flight, run the work-stealing on-idle hook
/// (§4.6); otherwise nudge the dispatcher to keep filling concurrency.
async fn on_worker_activity_settled(worker: &Arc<Worker>, ctx: &DispatchContext) {
    if worker.queue.is_empty() && worker.queue.in_flight() == 0 {
        crate::rebalancer::on_idle(worker, &ctx.registry).await;
    }
    worker.queue.wake();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Complexity, Kind};

    fn sample_classification() -> Classification {
        Classification {
            kind: Kind::General,
            complexity: Complexity::Medium,
            estimated_tokens: 50,
        }
    }

    #[test]
    fn fifo_ordering_at_head() {
        let queue = WorkerQueue::new();
        let (r1, _rx1) = QueuedRequest::new("first".into(), sample_classification());
        let (r2, _rx2) = QueuedRequest::new("second".into(), sample_classification());
        queue.push_back(r1);
        queue.push_back(r2);

        let popped = queue.pop_front().unwrap();
        assert_eq!(popped.prompt, "first");
    }

    #[test]
    fn pop_back_for_rebalancer_steal() {
        let queue = WorkerQueue::new();
        let (r1, _rx1) = QueuedRequest::new("first".into(), sample_classification());
        let (r2, _rx2) = QueuedRequest::new("second".into(), sample_classification());
        queue.push_back(r1);
        queue.push_back(r2);

        let stolen = queue.pop_back().unwrap();
        assert_eq!(stolen.prompt, "second");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn empty_queue_pops_none() {
        let queue = WorkerQueue::new();
        assert!(queue.pop_front().is_none());
        assert!(queue.pop_back().is_none());
    }

    #[tokio::test]
    async fn resolve_delivers_text_to_receiver() {
        let (request, rx) = QueuedRequest::new("hello".into(), sample_classification());
        request.resolve("world".to_string());
        assert_eq!(rx.await.unwrap(), "world");
    }

    #[test]
    fn request_ids_are_unique_and_increasing() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b > a);
    }
}
