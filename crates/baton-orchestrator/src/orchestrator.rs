//! Orchestrator: wires routing, execution, handoffs, consensus and fidelity
//! around one event channel

use async_trait::async_trait;
use baton_consensus::{ConsensusAlgorithm, ConsensusEngine, ConsensusResult, VoteOption};
use baton_core::{
    BatonConfig, BatonError, Priority, Result, RoutingDecision, SharedClock, SharedIds,
    SystemClock, Task, UuidIds, Worker, WorkerId,
};
use baton_events::{
    Event, EventChannel, EventHandler, EventPayload, EventType, Subscription, SystemError,
    TaskCreated,
};
use baton_fidelity::{FidelityReport, FidelityTracker};
use baton_handoff::{ContextPreservationStore, Handoff, HandoffManager};
use baton_recovery::{ErrorRecoveryManager, FallbackRegistry, OperationContext};
use baton_router::TaskRouter;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};

use crate::executor::{ExecutionPool, WorkerExecutor};

const COMPONENT: &str = "orchestrator";

/// Result of running one task end to end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    pub task_id: String,
    pub decision: RoutingDecision,
    pub output: serde_json::Value,
    /// "primary" or the fallback provider that produced `output`
    pub served_by: String,
    pub degraded: bool,
}

/// Counts from a maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub pruned_routes: usize,
    pub expired_handoffs: usize,
    pub pruned_handoffs: usize,
}

pub struct Orchestrator {
    config: BatonConfig,
    events: EventChannel,
    router: TaskRouter,
    consensus: ConsensusEngine,
    handoffs: HandoffManager,
    recovery: ErrorRecoveryManager,
    fallbacks: FallbackRegistry,
    fidelity: Arc<FidelityTracker>,
    pool: ExecutionPool,
    active_tasks: AtomicUsize,
    tasks_done: Notify,
}

impl Orchestrator {
    /// Create an orchestrator on the system clock with uuid ids
    pub fn new(config: BatonConfig, executor: Arc<dyn WorkerExecutor>) -> Arc<Self> {
        Self::with_runtime(config, executor, SystemClock::shared(), UuidIds::shared())
    }

    /// Create an orchestrator with an injected clock and id generator
    pub fn with_runtime(
        config: BatonConfig,
        executor: Arc<dyn WorkerExecutor>,
        clock: SharedClock,
        ids: SharedIds,
    ) -> Arc<Self> {
        let events = EventChannel::new(&config.events, clock.clone(), ids.clone());
        let router = TaskRouter::new(config.router.clone(), events.clone(), clock.clone());
        let consensus = ConsensusEngine::new(
            config.consensus.clone(),
            events.clone(),
            clock.clone(),
            ids.clone(),
        );
        let handoffs = HandoffManager::new(
            config.handoff.clone(),
            Arc::new(ContextPreservationStore::new()),
            events.clone(),
            clock.clone(),
            ids,
        );
        let recovery = ErrorRecoveryManager::new(config.recovery.clone(), events.clone());
        let fidelity = Arc::new(FidelityTracker::new(config.fidelity.clone(), clock));
        FidelityTracker::attach(&fidelity, &events);
        let pool = ExecutionPool::new(executor, &config.execution);

        info!(
            max_in_flight = config.events.max_in_flight,
            max_parallel = pool.max_parallel(),
            "Orchestrator initialized"
        );

        Arc::new(Self {
            config,
            events,
            router,
            consensus,
            handoffs,
            recovery,
            fallbacks: FallbackRegistry::new(),
            fidelity,
            pool,
            active_tasks: AtomicUsize::new(0),
            tasks_done: Notify::new(),
        })
    }

    pub fn config(&self) -> &BatonConfig {
        &self.config
    }

    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    pub fn router(&self) -> &TaskRouter {
        &self.router
    }

    pub fn consensus(&self) -> &ConsensusEngine {
        &self.consensus
    }

    pub fn handoffs(&self) -> &HandoffManager {
        &self.handoffs
    }

    pub fn recovery(&self) -> &ErrorRecoveryManager {
        &self.recovery
    }

    pub fn fallbacks(&self) -> &FallbackRegistry {
        &self.fallbacks
    }

    pub fn fidelity(&self) -> &Arc<FidelityTracker> {
        &self.fidelity
    }

    /// Register a worker for routing and voting
    pub async fn register_worker(&self, worker: Worker) -> Result<()> {
        self.router.register_worker(worker.clone()).await?;
        self.consensus.register_worker(worker).await;
        Ok(())
    }

    pub async fn unregister_worker(&self, worker_id: &str) -> Result<Worker> {
        let worker = self.router.unregister_worker(worker_id).await?;
        self.consensus.unregister_worker(worker_id).await;
        Ok(worker)
    }

    /// Announce a new task. Returns the `task.created` event id.
    pub fn submit_task(&self, task: &Task) -> String {
        debug!(task = %task.id, "Submitting task");
        self.events
            .publish(COMPONENT, EventPayload::TaskCreated(TaskCreated::from(task)))
    }

    /// Run every submitted task through the pipeline
    ///
    /// Each `task.created` event spawns [`run_task`](Self::run_task); failures
    /// are published as `system.error`. Unsubscribe the returned handle to
    /// stop feeding the pipeline.
    pub fn attach(self: &Arc<Self>) -> Subscription {
        let handler = Arc::new(TaskCreatedHandler {
            orchestrator: Arc::downgrade(self),
        });
        info!("Pipeline attached to task.created");
        self.events
            .subscribe(EventType::TaskCreated, handler, None)
    }

    /// Route, execute with retry and fallback, then release the worker
    #[instrument(skip(self, task), fields(task = %task.id))]
    pub async fn run_task(&self, task: &Task) -> Result<TaskOutcome> {
        let decision = self.router.route_task(task).await?;
        let worker = match self.router.worker(&decision.worker_id).await {
            Some(worker) => worker,
            None => return Err(BatonError::UnknownWorker(decision.worker_id.clone())),
        };

        let ctx = OperationContext::new(
            format!("execute.{}", task.category),
            task.id.clone(),
            worker.id.clone(),
        );
        let executed = self
            .recovery
            .execute(&ctx, || self.pool.run(&worker, task))
            .await;

        let outcome = match executed {
            Ok(output) => Ok(TaskOutcome {
                task_id: task.id.clone(),
                decision: decision.clone(),
                output,
                served_by: "primary".to_string(),
                degraded: false,
            }),
            Err(e) if e.is_validation() => Err(e),
            Err(e) => {
                warn!(error = %e, "Execution failed, trying fallback providers");
                self.fallbacks
                    .execute_with_fallback(
                        &task.category,
                        move || async move { Err(anyhow::Error::from(e)) },
                        &task.context,
                    )
                    .await
                    .map(|served| TaskOutcome {
                        task_id: task.id.clone(),
                        decision: decision.clone(),
                        output: served.value,
                        served_by: served.served_by,
                        degraded: served.degraded,
                    })
            }
        };

        if let Err(e) = self.router.release_worker(&decision.worker_id).await {
            warn!(error = %e, "Could not release worker");
        }
        outcome
    }

    /// Start handing a task from one worker to another
    pub async fn hand_off(
        &self,
        source: &str,
        target: &str,
        task: &Task,
        context: serde_json::Value,
        priority: Priority,
    ) -> Result<Handoff> {
        if self.router.worker(target).await.is_none() {
            return Err(BatonError::UnknownWorker(target.to_string()));
        }
        self.handoffs
            .initiate_handoff(source, target, task, context, priority)
            .await
    }

    /// Acknowledge a handoff; falls back to the preserved snapshot
    ///
    /// Only the handoff's target may accept it. Anyone else is rejected
    /// before the snapshot fallback is considered.
    pub async fn accept_handoff(
        &self,
        handoff_id: &str,
        worker_id: &str,
    ) -> Result<serde_json::Value> {
        let handoff = self
            .handoffs
            .handoff(handoff_id)
            .await
            .ok_or_else(|| BatonError::UnknownHandoff(handoff_id.to_string()))?;
        if handoff.target_agent_id != worker_id {
            warn!(handoff = %handoff_id, worker = %worker_id, "Handoff accepted by non-target");
            return Err(BatonError::Validation(format!(
                "handoff {} is addressed to {}, not {}",
                handoff_id, handoff.target_agent_id, worker_id
            )));
        }

        let ctx = OperationContext::new("handoff.accept", handoff.task_id, worker_id);
        self.recovery
            .execute_handoff_with_fallback(
                &ctx,
                || async {
                    self.handoffs
                        .complete_handoff(handoff_id, worker_id)
                        .await
                        .map_err(anyhow::Error::from)
                },
                || async {
                    self.handoffs
                        .restore_context(handoff_id)
                        .await
                        .map_err(anyhow::Error::from)
                },
            )
            .await
    }

    /// Run a voting session among the given ballots and close it
    pub async fn decide(
        &self,
        topic: &str,
        options: Vec<VoteOption>,
        ballots: &[(WorkerId, String)],
        algorithm: ConsensusAlgorithm,
        quorum: Option<usize>,
    ) -> Result<ConsensusResult> {
        let session = self.consensus.create_session(topic, options, quorum).await?;
        for (worker_id, option_id) in ballots {
            let accepted = self
                .consensus
                .cast_vote(&session.id, worker_id, option_id, None)
                .await?;
            if !accepted {
                debug!(worker = %worker_id, option = %option_id, "Ballot rejected");
            }
        }
        self.consensus
            .close_session(&session.id, algorithm, None)
            .await
    }

    /// Prune routing memory, expire stale handoffs and drop old settled ones
    pub async fn maintenance(&self) -> MaintenanceReport {
        let report = MaintenanceReport {
            pruned_routes: self.router.prune_memory(),
            expired_handoffs: self.handoffs.expire_stale_handoffs().await.len(),
            pruned_handoffs: self
                .handoffs
                .prune_settled(self.config.handoff.retention())
                .await
                .len(),
        };
        debug!(?report, "Maintenance pass");
        report
    }

    /// Resolve once no pipeline task is running and the channel is idle
    pub async fn wait_idle(&self) {
        loop {
            self.events.wait_idle().await;

            let notified = self.tasks_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.active_tasks.load(Ordering::Acquire) == 0 {
                let stats = self.events.stats();
                if stats.queued == 0 && stats.in_flight == 0 {
                    return;
                }
                continue;
            }
            notified.await;
        }
    }

    /// Fidelity of everything observed so far
    pub async fn fidelity_report(&self) -> FidelityReport {
        self.wait_idle().await;
        self.fidelity.validate().await
    }
}

/// Feeds `task.created` events into the pipeline
struct TaskCreatedHandler {
    orchestrator: Weak<Orchestrator>,
}

#[async_trait]
impl EventHandler for TaskCreatedHandler {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let EventPayload::TaskCreated(created) = &event.payload else {
            return Ok(());
        };
        let Some(orchestrator) = self.orchestrator.upgrade() else {
            return Ok(());
        };

        let task = Task {
            id: created.task_id.clone(),
            description: created.description.clone(),
            category: created.category.clone(),
            priority: created.priority,
            context: created.context.clone(),
            created_at: event.timestamp,
        };

        orchestrator.active_tasks.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            if let Err(e) = orchestrator.run_task(&task).await {
                error!(task = %task.id, error = %e, "Task failed");
                let mut failure = SystemError::new(COMPONENT, e.to_string());
                failure.task_id = Some(task.id.clone());
                orchestrator
                    .events
                    .publish(COMPONENT, EventPayload::SystemError(failure));
            }
            orchestrator.active_tasks.fetch_sub(1, Ordering::AcqRel);
            orchestrator.tasks_done.notify_waiters();
        });
        Ok(())
    }
}
