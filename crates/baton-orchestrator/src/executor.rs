//! Worker execution on a bounded pool

use async_trait::async_trait;
use baton_core::config::ExecutionConfig;
use baton_core::{Task, TaskId, Worker};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

/// Runs a task on a worker (allows the host to plug in real agents)
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    async fn execute(&self, worker: &Worker, task: &Task) -> anyhow::Result<serde_json::Value>;
}

/// Caps how many worker executions run at once
pub struct ExecutionPool {
    executor: Arc<dyn WorkerExecutor>,
    permits: Arc<Semaphore>,
    max_parallel: usize,
}

impl ExecutionPool {
    pub fn new(executor: Arc<dyn WorkerExecutor>, config: &ExecutionConfig) -> Self {
        let max_parallel = config.max_parallel.max(1);
        Self {
            executor,
            permits: Arc::new(Semaphore::new(max_parallel)),
            max_parallel,
        }
    }

    pub async fn run(&self, worker: &Worker, task: &Task) -> anyhow::Result<serde_json::Value> {
        let _permit = self.permits.acquire().await?;
        debug!(worker = %worker.id, task = %task.id, "Executing task");
        self.executor.execute(worker, task).await
    }

    /// Free execution slots
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }
}

/// Deterministic executor with scripted failures
///
/// Every task succeeds unless failures were queued for it with
/// [`fail_next`](Self::fail_next). Used by `baton simulate` and tests.
#[derive(Default)]
pub struct ScriptedExecutor {
    failures: Mutex<HashMap<TaskId, u32>>,
    latency: Duration,
    calls: AtomicU64,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `times` executions of `task_id` fail
    pub fn fail_next(&self, task_id: &str, times: u32) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id.to_string(), times);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl WorkerExecutor for ScriptedExecutor {
    async fn execute(&self, worker: &Worker, task: &Task) -> anyhow::Result<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let should_fail = {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            match failures.get_mut(&task.id) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        if should_fail {
            anyhow::bail!("{} failed on task {}", worker.name, task.id);
        }

        Ok(json!({
            "taskId": task.id,
            "workerId": worker.id,
            "output": format!("{} completed: {}", worker.name, task.description),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl WorkerExecutor for Gauge {
        async fn execute(&self, _: &Worker, _: &Task) -> anyhow::Result<serde_json::Value> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(serde_json::Value::Null)
        }
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let executor = ScriptedExecutor::new();
        executor.fail_next("t-1", 2);
        let worker = Worker::new("w-1", "Ada", 1);
        let task = Task::new("t-1", "build");

        assert!(executor.execute(&worker, &task).await.is_err());
        assert!(executor.execute(&worker, &task).await.is_err());
        let output = executor.execute(&worker, &task).await.unwrap();
        assert_eq!(output["workerId"], "w-1");
        assert_eq!(executor.calls(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_bounds_parallelism() {
        let gauge = Arc::new(Gauge {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let pool = Arc::new(ExecutionPool::new(
            gauge.clone(),
            &ExecutionConfig { max_parallel: 2 },
        ));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    let worker = Worker::new("w-1", "Ada", 8);
                    pool.run(&worker, &Task::new(format!("t-{}", i), "x")).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }
}
