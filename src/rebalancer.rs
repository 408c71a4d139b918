//! Work-Stealing Rebalancer: a 500ms tick that drains hot queues into idle
//! workers, plus the on-idle hook a dispatcher invokes when it drains to
//! empty (§4.6).

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::RuntimeKnobs;
use crate::registry::{Registry, Worker};
use crate::velocity::{self, MAX_PRE_WARM_MOVE};

const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Invoked when a dispatcher drains its worker's queue to empty: steals one
/// tail item from the busiest online peer, if any has work.
pub async fn on_idle(worker: &Arc<Worker>, registry: &Arc<Registry>) {
    let peers = registry.online_workers();
    let donor = peers
        .iter()
        .filter(|w| w.id != worker.id)
        .max_by_key(|w| w.queue.len());

    if let Some(donor) = donor {
        if let Some(item) = donor.queue.pop_back() {
            debug!(recipient = %worker.id, donor = %donor.id, "on-idle steal");
            worker.queue.push_back(item);
        }
    }
}

/// Spawns the periodic rebalancer loop. Holds no state of its own beyond
/// the interval timer and the shared knobs handle; every tick reads fresh
/// worker/queue snapshots and the current `pre_warm_threshold`, so the
/// control API can adjust it without restarting the loop.
pub fn spawn_rebalancer(registry: Arc<Registry>, knobs: Arc<Mutex<RuntimeKnobs>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            interval.tick().await;
            let threshold = knobs.lock().unwrap_or_else(|e| e.into_inner()).pre_warm_threshold;
            tick(&registry, threshold);
        }
    })
}

fn tick(registry: &Registry, pre_warm_threshold: f64) {
    let workers = registry.online_workers();
    if workers.is_empty() {
        return;
    }

    for worker in &workers {
        let queue_size = worker.queue.len();
        worker.lock().velocity.record(queue_size);
    }

    pre_warm(&workers, pre_warm_threshold);
    redistribute_idle(&workers);
}

/// Step 1 of the tick: for each qualifying donor, push up to
/// `MAX_PRE_WARM_MOVE` items into an under-utilized recipient ahead of the
/// donor actually running dry (§4.7).
fn pre_warm(workers: &[Arc<Worker>], threshold: f64) {
    for donor in workers {
        let queue_size = donor.queue.len();
        let capacity = donor.capacity();
        let qualifies = donor.lock().velocity.is_pre_warm_donor(queue_size, capacity, threshold);
        if !qualifies {
            continue;
        }

        let Some(recipient) = workers
            .iter()
            .find(|w| w.id != donor.id && velocity::is_recipient_candidate(w.queue.len(), w.capacity()))
        else {
            continue;
        };

        let mut moved = 0;
        while moved < MAX_PRE_WARM_MOVE {
            let Some(item) = donor.queue.pop_back() else {
                break;
            };
            recipient.queue.push_back(item);
            moved += 1;
        }
        if moved > 0 {
            debug!(donor = %donor.id, recipient = %recipient.id, moved, "pre-warm move");
            recipient.queue.wake();
        }
    }
}

/// Step 2 of the tick: for each idle worker, steal the tail item from the
/// busiest donor with remaining items. At most one item moved per idle
/// worker per tick.
fn redistribute_idle(workers: &[Arc<Worker>]) {
    let idle: Vec<&Arc<Worker>> = workers.iter().filter(|w| w.queue.is_empty()).collect();
    if idle.is_empty() {
        return;
    }

    let mut donors: Vec<&Arc<Worker>> = workers.iter().filter(|w| !w.queue.is_empty()).collect();
    donors.sort_by_key(|w| std::cmp::Reverse(w.queue.len()));

    for idle_worker in idle {
        let Some(donor) = donors.iter().find(|d| d.id != idle_worker.id && !d.queue.is_empty()) else {
            continue;
        };
        if let Some(item) = donor.queue.pop_back() {
            debug!(recipient = %idle_worker.id, donor = %donor.id, "idle redistribution");
            idle_worker.queue.push_back(item);
            idle_worker.queue.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Classification, Complexity, Kind};
    use crate::queue::QueuedRequest;

    fn classification() -> Classification {
        Classification {
            kind: Kind::General,
            complexity: Complexity::Medium,
            estimated_tokens: 50,
        }
    }

    fn online_worker(registry: &Registry, id: &str, tps: f64, capacity: usize) -> Arc<Worker> {
        let workers = registry.seed(&[id.to_string()]);
        let worker = workers[0].clone();
        let mut inner = worker.lock();
        inner.mark_online(tps);
        inner.capacity = capacity;
        drop(inner);
        worker
    }

    #[tokio::test]
    async fn on_idle_steals_from_busiest_peer() {
        let registry = Arc::new(Registry::new());
        let idle = online_worker(&registry, "idle", 100.0, 10);
        let busy = online_worker(&registry, "busy", 100.0, 10);

        let (r1, _rx1) = QueuedRequest::new("a".into(), classification());
        let (r2, _rx2) = QueuedRequest::new("b".into(), classification());
        busy.queue.push_back(r1);
        busy.queue.push_back(r2);

        on_idle(&idle, &registry).await;

        assert_eq!(idle.queue.len(), 1);
        assert_eq!(busy.queue.len(), 1);
    }

    #[tokio::test]
    async fn on_idle_noop_with_no_donor() {
        let registry = Arc::new(Registry::new());
        let idle = online_worker(&registry, "idle", 100.0, 10);
        on_idle(&idle, &registry).await;
        assert_eq!(idle.queue.len(), 0);
    }

    #[test]
    fn redistribute_idle_moves_one_item_per_idle_worker() {
        let registry = Registry::new();
        let idle_a = online_worker(&registry, "idle-a", 100.0, 10);
        let idle_b = online_worker(&registry, "idle-b", 100.0, 10);
        let busy = online_worker(&registry, "busy", 100.0, 10);

        for label in ["a", "b", "c"] {
            let (req, _rx) = QueuedRequest::new(label.into(), classification());
            busy.queue.push_back(req);
        }

        redistribute_idle(&[idle_a.clone(), idle_b.clone(), busy.clone()]);

        assert_eq!(idle_a.queue.len(), 1);
        assert_eq!(idle_b.queue.len(), 1);
        assert_eq!(busy.queue.len(), 1);
    }

    #[test]
    fn redistribute_idle_noop_when_no_donors() {
        let registry = Registry::new();
        let idle_a = online_worker(&registry, "idle-a", 100.0, 10);
        redistribute_idle(&[idle_a.clone()]);
        assert_eq!(idle_a.queue.len(), 0);
    }
}
