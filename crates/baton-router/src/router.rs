//! Task router: greedy best-fit worker selection
//!
//! Routing order for a task:
//! 1. Sticky reuse of a fresh routing-memory entry whose worker has room
//! 2. Expertise/workload scoring over workers with spare capacity
//! 3. Least-loaded worker when everyone is full
//!
//! Workload is reserved with an atomic compare-and-swap per worker, and
//! decisions for the same task id are serialized, so concurrent routing
//! never pushes a worker past capacity through the scored path.

use baton_core::config::RouterConfig;
use baton_core::{
    BatonError, DecisionSource, Result, RoutingDecision, SharedClock, Task, TaskId, Worker,
    WorkerId,
};
use baton_events::{EventChannel, EventPayload, TaskRouted};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::memory::RoutingMemory;

const COMPONENT: &str = "router";

/// Registry entry: immutable profile plus an atomically updated workload
#[derive(Debug)]
struct WorkerSlot {
    profile: Worker,
    workload: AtomicU32,
}

impl WorkerSlot {
    fn new(worker: Worker) -> Self {
        let workload = AtomicU32::new(worker.workload);
        Self {
            profile: worker,
            workload,
        }
    }

    fn snapshot(&self) -> Worker {
        let mut worker = self.profile.clone();
        worker.workload = self.workload.load(Ordering::Acquire);
        worker
    }

    /// Take one slot if the worker is below capacity
    fn try_reserve(&self) -> bool {
        let capacity = self.profile.capacity;
        self.workload
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                (w < capacity).then_some(w + 1)
            })
            .is_ok()
    }

    /// Take a slot regardless of capacity (overload path)
    fn force_reserve(&self) -> u32 {
        self.workload.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Give back one slot, never going below zero
    fn release(&self) -> u32 {
        match self
            .workload
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| Some(w.saturating_sub(1)))
        {
            Ok(previous) | Err(previous) => previous.saturating_sub(1),
        }
    }
}

/// Per-task locks so only one routing decision per task is in progress
#[derive(Default)]
struct TaskLocks {
    locks: Mutex<HashMap<TaskId, Arc<tokio::sync::Mutex<()>>>>,
}

impl TaskLocks {
    fn get(&self, task_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release(&self, task_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Map plus our handle: nobody else is waiting on this task
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(task_id);
        }
    }
}

/// Fraction of a worker's expertise tags found in the description
///
/// Matching is case-insensitive substring search. A worker without tags
/// matches nothing.
pub fn expertise_match(worker: &Worker, description: &str) -> f64 {
    if worker.expertise.is_empty() {
        return 0.0;
    }
    let description = description.to_lowercase();
    let matched = worker
        .expertise
        .iter()
        .filter(|tag| description.contains(&tag.to_lowercase()))
        .count();
    matched as f64 / worker.expertise.len() as f64
}

/// Routes tasks to the best-fit registered worker
pub struct TaskRouter {
    config: RouterConfig,
    workers: RwLock<Vec<Arc<WorkerSlot>>>,
    memory: Mutex<RoutingMemory>,
    task_locks: TaskLocks,
    events: EventChannel,
    clock: SharedClock,
}

impl TaskRouter {
    pub fn new(config: RouterConfig, events: EventChannel, clock: SharedClock) -> Self {
        let memory = RoutingMemory::new(config.memory_window(), config.max_memory_entries);
        Self {
            config,
            workers: RwLock::new(Vec::new()),
            memory: Mutex::new(memory),
            task_locks: TaskLocks::default(),
            events,
            clock,
        }
    }

    fn memory(&self) -> std::sync::MutexGuard<'_, RoutingMemory> {
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a worker to the registry
    pub async fn register_worker(&self, worker: Worker) -> Result<()> {
        if worker.capacity == 0 {
            return Err(BatonError::Validation(format!(
                "worker {} must have capacity of at least 1",
                worker.id
            )));
        }

        let mut workers = self.workers.write().await;
        if workers.iter().any(|w| w.profile.id == worker.id) {
            return Err(BatonError::DuplicateWorker(worker.id));
        }

        info!(
            worker = %worker.id,
            capacity = worker.capacity,
            expertise = ?worker.expertise,
            "Registered worker"
        );
        workers.push(Arc::new(WorkerSlot::new(worker)));
        Ok(())
    }

    /// Remove a worker, returning its final state
    pub async fn unregister_worker(&self, worker_id: &str) -> Result<Worker> {
        let mut workers = self.workers.write().await;
        let idx = workers
            .iter()
            .position(|w| w.profile.id == worker_id)
            .ok_or_else(|| BatonError::UnknownWorker(worker_id.to_string()))?;

        let slot = workers.remove(idx);
        info!(worker = %worker_id, "Unregistered worker");
        Ok(slot.snapshot())
    }

    /// Pick a worker for `task` and reserve one unit of its capacity
    #[instrument(skip(self, task), fields(task = %task.id))]
    pub async fn route_task(&self, task: &Task) -> Result<RoutingDecision> {
        let lock = self.task_locks.get(&task.id);
        let decision = {
            let _guard = lock.lock().await;
            self.decide(task).await
        };
        self.task_locks.release(&task.id, lock);

        let decision = decision?;
        self.events.publish(
            COMPONENT,
            EventPayload::TaskRouted(TaskRouted {
                task_id: decision.task_id.clone(),
                agent_id: decision.worker_id.clone(),
                confidence: decision.confidence,
                rationale: decision.rationale.clone(),
                source: decision.source,
            }),
        );
        Ok(decision)
    }

    async fn decide(&self, task: &Task) -> Result<RoutingDecision> {
        let workers = self.workers.read().await;
        if workers.is_empty() {
            return Err(BatonError::NoWorkersRegistered);
        }

        let now = self.clock.now();

        // 1. Sticky routing
        let remembered = self.memory().lookup(&task.id, now);
        if let Some(previous) = remembered {
            if let Some(slot) = workers.iter().find(|w| w.profile.id == previous.worker_id) {
                if slot.try_reserve() {
                    debug!(worker = %previous.worker_id, "Reusing routing memory");
                    return Ok(RoutingDecision {
                        task_id: task.id.clone(),
                        worker_id: previous.worker_id,
                        confidence: self.config.sticky_confidence,
                        rationale: format!(
                            "Reusing routing decision from {} for this task",
                            previous.decided_at.to_rfc3339()
                        ),
                        source: DecisionSource::Memory,
                        decided_at: now,
                    });
                }
            }
        }

        // 2. Score workers with spare capacity; stable sort keeps registry order on ties
        let mut scored: Vec<(f64, f64, &Arc<WorkerSlot>)> = workers
            .iter()
            .map(|slot| {
                let worker = slot.snapshot();
                let matched = expertise_match(&worker, &task.description);
                let score = if worker.has_capacity() {
                    self.config.expertise_weight * matched
                        + self.config.workload_weight * worker.workload_factor()
                } else {
                    -1.0
                };
                (score, matched, slot)
            })
            .filter(|(score, _, _)| *score >= 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        for (score, matched, slot) in scored {
            // Lost a race for the last slot: try the next best
            if !slot.try_reserve() {
                continue;
            }
            let worker = slot.snapshot();
            let decision = RoutingDecision {
                task_id: task.id.clone(),
                worker_id: worker.id.clone(),
                confidence: score.clamp(0.0, 1.0),
                rationale: format!(
                    "{} matched {:.0}% of expertise tags with {}/{} slots in use",
                    worker.name,
                    matched * 100.0,
                    worker.workload.saturating_sub(1),
                    worker.capacity
                ),
                source: DecisionSource::Scored,
                decided_at: now,
            };
            info!(worker = %worker.id, confidence = decision.confidence, "Routed task");
            self.memory().record(decision.clone());
            return Ok(decision);
        }

        // 3. Everyone is full: least loaded, first registered on ties
        let Some(slot) = workers
            .iter()
            .min_by_key(|slot| slot.workload.load(Ordering::Acquire))
        else {
            return Err(BatonError::NoWorkersRegistered);
        };
        let previous_load = slot.workload.load(Ordering::Acquire);
        slot.force_reserve();

        let decision = RoutingDecision {
            task_id: task.id.clone(),
            worker_id: slot.profile.id.clone(),
            confidence: self.config.overload_confidence,
            rationale: format!(
                "All workers at capacity; assigned least-loaded worker {} ({}/{})",
                slot.profile.name, previous_load, slot.profile.capacity
            ),
            source: DecisionSource::Overload,
            decided_at: now,
        };
        warn!(worker = %slot.profile.id, "All workers at capacity");
        self.memory().record(decision.clone());
        Ok(decision)
    }

    /// Completion signal: give back one unit of the worker's capacity
    pub async fn release_worker(&self, worker_id: &str) -> Result<Worker> {
        let workers = self.workers.read().await;
        let slot = workers
            .iter()
            .find(|w| w.profile.id == worker_id)
            .ok_or_else(|| BatonError::UnknownWorker(worker_id.to_string()))?;

        let remaining = slot.release();
        debug!(worker = %worker_id, workload = remaining, "Released worker slot");
        Ok(slot.snapshot())
    }

    /// Overwrite a worker's workload (external reconciliation)
    pub async fn set_workload(&self, worker_id: &str, workload: u32) -> Result<()> {
        let workers = self.workers.read().await;
        let slot = workers
            .iter()
            .find(|w| w.profile.id == worker_id)
            .ok_or_else(|| BatonError::UnknownWorker(worker_id.to_string()))?;
        slot.workload.store(workload, Ordering::Release);
        Ok(())
    }

    /// Snapshot of all workers in registration order
    pub async fn workers(&self) -> Vec<Worker> {
        self.workers.read().await.iter().map(|w| w.snapshot()).collect()
    }

    pub async fn worker(&self, worker_id: &str) -> Option<Worker> {
        self.workers
            .read()
            .await
            .iter()
            .find(|w| w.profile.id == worker_id)
            .map(|w| w.snapshot())
    }

    pub async fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers
            .read()
            .await
            .iter()
            .map(|w| w.profile.id.clone())
            .collect()
    }

    pub fn memory_len(&self) -> usize {
        self.memory().len()
    }

    /// Drop expired routing-memory entries
    pub fn prune_memory(&self) -> usize {
        let now = self.clock.now();
        self.memory().prune(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_core::{ManualClock, SequentialIds};
    use chrono::Duration;

    fn setup() -> (TaskRouter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let events = EventChannel::new(
            &Default::default(),
            clock.clone(),
            Arc::new(SequentialIds::new()),
        );
        let router = TaskRouter::new(RouterConfig::default(), events, clock.clone());
        (router, clock)
    }

    fn rust_worker() -> Worker {
        Worker::new("w-rust", "Rusty", 2).with_expertise(["rust", "async"])
    }

    fn docs_worker() -> Worker {
        Worker::new("w-docs", "Scribe", 2).with_expertise(["docs", "markdown"])
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let (router, _) = setup();
        let err = router.route_task(&Task::new("t-1", "anything")).await.unwrap_err();
        assert!(matches!(err, BatonError::NoWorkersRegistered));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let (router, _) = setup();
        router.register_worker(rust_worker()).await.unwrap();
        let err = router.register_worker(rust_worker()).await.unwrap_err();
        assert!(matches!(err, BatonError::DuplicateWorker(_)));
    }

    #[tokio::test]
    async fn test_expertise_wins() {
        let (router, _) = setup();
        router.register_worker(docs_worker()).await.unwrap();
        router.register_worker(rust_worker()).await.unwrap();

        let task = Task::new("t-1", "Fix the ASYNC deadlock in the Rust scheduler");
        let decision = router.route_task(&task).await.unwrap();

        assert_eq!(decision.worker_id, "w-rust");
        assert_eq!(decision.source, DecisionSource::Scored);
        // 0.8 * 1.0 + 0.2 * 1.0
        assert!((decision.confidence - 1.0).abs() < 1e-9);
        assert_eq!(router.worker("w-rust").await.unwrap().workload, 1);
    }

    #[tokio::test]
    async fn test_ties_go_to_first_registered() {
        let (router, _) = setup();
        router.register_worker(docs_worker()).await.unwrap();
        router.register_worker(rust_worker()).await.unwrap();

        let decision = router
            .route_task(&Task::new("t-1", "unrelated chore"))
            .await
            .unwrap();
        assert_eq!(decision.worker_id, "w-docs");
        assert!((decision.confidence - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_full_worker_never_selected() {
        let (router, _) = setup();
        router
            .register_worker(rust_worker().with_workload(2))
            .await
            .unwrap();
        router.register_worker(docs_worker()).await.unwrap();

        let decision = router
            .route_task(&Task::new("t-1", "rust async work"))
            .await
            .unwrap();
        assert_eq!(decision.worker_id, "w-docs");
    }

    #[tokio::test]
    async fn test_all_full_falls_back_to_least_loaded() {
        let (router, _) = setup();
        router
            .register_worker(Worker::new("w-a", "A", 2).with_workload(3))
            .await
            .unwrap();
        router
            .register_worker(Worker::new("w-b", "B", 2).with_workload(2))
            .await
            .unwrap();

        let decision = router.route_task(&Task::new("t-1", "work")).await.unwrap();
        assert_eq!(decision.worker_id, "w-b");
        assert_eq!(decision.confidence, 0.3);
        assert_eq!(decision.source, DecisionSource::Overload);
        assert!(decision.rationale.contains("at capacity"));
    }

    #[tokio::test]
    async fn test_sticky_routing() {
        let (router, clock) = setup();
        router.register_worker(docs_worker()).await.unwrap();
        router.register_worker(rust_worker()).await.unwrap();

        let task = Task::new("t-1", "rust async");
        let first = router.route_task(&task).await.unwrap();
        clock.advance(Duration::minutes(5));
        let second = router.route_task(&task).await.unwrap();

        assert_eq!(first.worker_id, second.worker_id);
        assert_eq!(second.confidence, 0.9);
        assert_eq!(second.source, DecisionSource::Memory);
    }

    #[tokio::test]
    async fn test_memory_expires_after_window() {
        let (router, clock) = setup();
        router.register_worker(rust_worker()).await.unwrap();

        let task = Task::new("t-1", "rust async");
        router.route_task(&task).await.unwrap();
        clock.advance(Duration::minutes(11));
        let again = router.route_task(&task).await.unwrap();

        assert_eq!(again.source, DecisionSource::Scored);
    }

    #[tokio::test]
    async fn test_sticky_skipped_when_worker_full() {
        let (router, _) = setup();
        router
            .register_worker(Worker::new("w-a", "A", 1).with_expertise(["rust"]))
            .await
            .unwrap();
        router.register_worker(docs_worker()).await.unwrap();

        let task = Task::new("t-1", "rust");
        let first = router.route_task(&task).await.unwrap();
        assert_eq!(first.worker_id, "w-a");

        let second = router.route_task(&task).await.unwrap();
        assert_eq!(second.worker_id, "w-docs");
        assert_eq!(second.source, DecisionSource::Scored);
    }

    #[tokio::test]
    async fn test_release_saturates_at_zero() {
        let (router, _) = setup();
        router.register_worker(rust_worker()).await.unwrap();

        let worker = router.release_worker("w-rust").await.unwrap();
        assert_eq!(worker.workload, 0);
        assert!(matches!(
            router.release_worker("missing").await.unwrap_err(),
            BatonError::UnknownWorker(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_routing_respects_capacity() {
        let (router, _) = setup();
        let router = Arc::new(router);
        router
            .register_worker(Worker::new("w-a", "A", 5))
            .await
            .unwrap();
        router
            .register_worker(Worker::new("w-b", "B", 5))
            .await
            .unwrap();

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let router = router.clone();
                tokio::spawn(async move {
                    router
                        .route_task(&Task::new(format!("t-{}", i), "work"))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let decisions: Vec<RoutingDecision> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert!(decisions.iter().all(|d| d.source == DecisionSource::Scored));
        for worker in router.workers().await {
            assert_eq!(worker.workload, 5);
        }
    }
}
