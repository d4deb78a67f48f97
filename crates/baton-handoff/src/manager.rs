//! Context handoff manager
//!
//! Moves a task's context from one worker to another:
//! - `initiate_handoff` records the handoff, snapshots the context and
//!   notifies the target worker through `handoff.initiated`
//! - `complete_handoff` is the target's acknowledgement and hands back the
//!   preserved context
//! - `fail_handoff` / `expire_stale_handoffs` give up on a handoff while
//!   keeping its snapshot for restore or rollback

use baton_core::config::HandoffConfig;
use baton_core::{BatonError, Priority, Result, SharedClock, SharedIds, Task, TaskId, WorkerId};
use baton_events::{EventChannel, EventPayload, HandoffInitiated, HandoffSettled, OperationOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::preservation::{ContextPreservationStore, ContextSnapshot};

const COMPONENT: &str = "handoff";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffStatus {
    Initiated,
    Completed,
    Failed,
}

impl std::fmt::Display for HandoffStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initiated => write!(f, "initiated"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A transfer of task context between two workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handoff {
    pub id: String,
    pub source_agent_id: WorkerId,
    pub target_agent_id: WorkerId,
    pub task_id: TaskId,
    pub context: serde_json::Value,
    pub priority: Priority,
    pub status: HandoffStatus,
    pub initiated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Handoff {
    fn settled(&self, error: Option<String>) -> HandoffSettled {
        HandoffSettled {
            handoff_id: self.id.clone(),
            task_id: self.task_id.clone(),
            source_agent_id: self.source_agent_id.clone(),
            target_agent_id: self.target_agent_id.clone(),
            error,
        }
    }
}

pub struct HandoffManager {
    config: HandoffConfig,
    handoffs: RwLock<HashMap<String, Arc<Mutex<Handoff>>>>,
    store: Arc<ContextPreservationStore>,
    events: EventChannel,
    clock: SharedClock,
    ids: SharedIds,
}

impl HandoffManager {
    pub fn new(
        config: HandoffConfig,
        store: Arc<ContextPreservationStore>,
        events: EventChannel,
        clock: SharedClock,
        ids: SharedIds,
    ) -> Self {
        Self {
            config,
            handoffs: RwLock::new(HashMap::new()),
            store,
            events,
            clock,
            ids,
        }
    }

    pub fn store(&self) -> &Arc<ContextPreservationStore> {
        &self.store
    }

    async fn handle(&self, handoff_id: &str) -> Option<Arc<Mutex<Handoff>>> {
        self.handoffs.read().await.get(handoff_id).cloned()
    }

    fn preservation_event(&self, operation: &str, handoff: &Handoff, error: Option<String>) {
        let mut outcome = OperationOutcome::new(operation)
            .with_task(handoff.task_id.clone())
            .with_agent(handoff.target_agent_id.clone());
        if let Some(error) = error {
            outcome = outcome.with_error(error);
        }
        self.events
            .publish(COMPONENT, EventPayload::context_preservation(outcome));
    }

    /// Start handing `task` over from `source` to `target`
    #[instrument(skip(self, task, context), fields(task = %task.id))]
    pub async fn initiate_handoff(
        &self,
        source: &str,
        target: &str,
        task: &Task,
        context: serde_json::Value,
        priority: Priority,
    ) -> Result<Handoff> {
        if source == target {
            return Err(BatonError::Validation(format!(
                "cannot hand off task {} from {} to itself",
                task.id, source
            )));
        }

        let now = self.clock.now();
        let handoff = Handoff {
            id: self.ids.next_id("handoff"),
            source_agent_id: source.to_string(),
            target_agent_id: target.to_string(),
            task_id: task.id.clone(),
            context: context.clone(),
            priority,
            status: HandoffStatus::Initiated,
            initiated_at: now,
            completed_at: None,
            failure_reason: None,
        };

        self.store
            .preserve(ContextSnapshot {
                handoff_id: handoff.id.clone(),
                task_id: task.id.clone(),
                context: context.clone(),
                preserved_at: now,
            })
            .await;
        self.preservation_event("preserve", &handoff, None);

        self.handoffs
            .write()
            .await
            .insert(handoff.id.clone(), Arc::new(Mutex::new(handoff.clone())));

        info!(handoff = %handoff.id, %source, %target, "Handoff initiated");
        self.events.publish(
            COMPONENT,
            EventPayload::HandoffInitiated(HandoffInitiated {
                handoff_id: handoff.id.clone(),
                source_agent_id: handoff.source_agent_id.clone(),
                target_agent_id: handoff.target_agent_id.clone(),
                task_id: handoff.task_id.clone(),
                context,
                priority,
            }),
        );
        Ok(handoff)
    }

    /// Acknowledge a handoff and take its context
    ///
    /// Only the target worker may acknowledge. Fails with `UnknownHandoff`
    /// if the handoff does not exist or is no longer pending.
    #[instrument(skip(self))]
    pub async fn complete_handoff(
        &self,
        handoff_id: &str,
        acknowledging_worker: &str,
    ) -> Result<serde_json::Value> {
        let handle = self
            .handle(handoff_id)
            .await
            .ok_or_else(|| BatonError::UnknownHandoff(handoff_id.to_string()))?;
        let mut handoff = handle.lock().await;

        if handoff.status != HandoffStatus::Initiated {
            return Err(BatonError::UnknownHandoff(handoff_id.to_string()));
        }
        if handoff.target_agent_id != acknowledging_worker {
            return Err(BatonError::Validation(format!(
                "handoff {} is addressed to {}, not {}",
                handoff_id, handoff.target_agent_id, acknowledging_worker
            )));
        }

        let context = match self.store.take(handoff_id).await {
            Some(snapshot) => snapshot.context,
            None => {
                // Snapshot was rolled back; fall back to the record's copy
                warn!("No preserved context, using handoff record");
                handoff.context.clone()
            }
        };

        handoff.status = HandoffStatus::Completed;
        handoff.completed_at = Some(self.clock.now());
        handoff.context = context.clone();

        info!(
            source = %handoff.source_agent_id,
            target = %handoff.target_agent_id,
            "Handoff completed"
        );
        self.events.publish(
            COMPONENT,
            EventPayload::HandoffCompleted(handoff.settled(None)),
        );
        self.events.publish(
            COMPONENT,
            EventPayload::agent_communication(
                OperationOutcome::new("handoff")
                    .with_task(handoff.task_id.clone())
                    .with_agent(handoff.target_agent_id.clone()),
            ),
        );
        Ok(context)
    }

    /// Give up on a pending handoff. The snapshot is kept.
    pub async fn fail_handoff(&self, handoff_id: &str, reason: impl Into<String>) -> Result<Handoff> {
        let handle = self
            .handle(handoff_id)
            .await
            .ok_or_else(|| BatonError::UnknownHandoff(handoff_id.to_string()))?;
        let mut handoff = handle.lock().await;

        if handoff.status != HandoffStatus::Initiated {
            return Err(BatonError::UnknownHandoff(handoff_id.to_string()));
        }

        let reason = reason.into();
        handoff.status = HandoffStatus::Failed;
        handoff.completed_at = Some(self.clock.now());
        handoff.failure_reason = Some(reason.clone());

        warn!(handoff = %handoff_id, %reason, "Handoff failed");
        self.events.publish(
            COMPONENT,
            EventPayload::HandoffFailed(handoff.settled(Some(reason.clone()))),
        );
        self.events.publish(
            COMPONENT,
            EventPayload::agent_communication(
                OperationOutcome::new("handoff")
                    .with_task(handoff.task_id.clone())
                    .with_agent(handoff.target_agent_id.clone())
                    .with_error(reason),
            ),
        );
        Ok(handoff.clone())
    }

    /// Fail every pending handoff older than the configured timeout
    ///
    /// Returns the ids of the expired handoffs.
    pub async fn expire_stale_handoffs(&self) -> Vec<String> {
        let cutoff = self.clock.now() - self.config.timeout();
        let handles: Vec<Arc<Mutex<Handoff>>> =
            self.handoffs.read().await.values().cloned().collect();

        let mut stale = Vec::new();
        for handle in handles {
            let handoff = handle.lock().await;
            if handoff.status == HandoffStatus::Initiated && handoff.initiated_at <= cutoff {
                stale.push(handoff.id.clone());
            }
        }
        stale.sort();

        let mut expired = Vec::new();
        for id in stale {
            let reason = format!("timed out after {}s", self.config.timeout_secs);
            // A concurrent completion wins; skip it
            if self.fail_handoff(&id, reason).await.is_ok() {
                expired.push(id);
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired stale handoffs");
        }
        expired
    }

    /// Drop completed or failed handoffs settled more than `older_than` ago
    ///
    /// Their leftover snapshots go with them. Returns the pruned ids.
    pub async fn prune_settled(&self, older_than: chrono::Duration) -> Vec<String> {
        let cutoff = self.clock.now() - older_than;
        let mut handoffs = self.handoffs.write().await;

        let mut settled = Vec::new();
        for (id, handle) in handoffs.iter() {
            let handoff = handle.lock().await;
            if handoff.status != HandoffStatus::Initiated
                && handoff.completed_at.is_some_and(|at| at <= cutoff)
            {
                settled.push(id.clone());
            }
        }
        settled.sort();
        for id in &settled {
            handoffs.remove(id);
        }
        drop(handoffs);

        for id in &settled {
            self.store.take(id).await;
        }
        if !settled.is_empty() {
            debug!(count = settled.len(), "Pruned settled handoffs");
        }
        settled
    }

    /// Preserved context for a handoff, leaving the handoff pending
    pub async fn restore_context(&self, handoff_id: &str) -> Result<serde_json::Value> {
        let result = self.store.restore(handoff_id).await;
        if let Some(handle) = self.handle(handoff_id).await {
            let handoff = handle.lock().await;
            let error = result.as_ref().err().map(|e| e.to_string());
            self.preservation_event("restore", &handoff, error);
        }
        debug!(handoff = %handoff_id, ok = result.is_ok(), "Context restore");
        result
    }

    /// Discard a handoff's snapshot permanently
    pub async fn rollback_context(&self, handoff_id: &str) -> Result<()> {
        self.store.rollback(handoff_id).await?;
        if let Some(handle) = self.handle(handoff_id).await {
            let handoff = handle.lock().await;
            self.preservation_event("rollback", &handoff, None);
        }
        info!(handoff = %handoff_id, "Context rolled back");
        Ok(())
    }

    pub async fn handoff(&self, handoff_id: &str) -> Option<Handoff> {
        let handle = self.handle(handoff_id).await?;
        let handoff = handle.lock().await;
        Some(handoff.clone())
    }

    /// Handoffs still waiting for acknowledgement
    pub async fn pending(&self) -> Vec<Handoff> {
        let handles: Vec<Arc<Mutex<Handoff>>> =
            self.handoffs.read().await.values().cloned().collect();
        let mut pending = Vec::new();
        for handle in handles {
            let handoff = handle.lock().await;
            if handoff.status == HandoffStatus::Initiated {
                pending.push(handoff.clone());
            }
        }
        pending.sort_by_key(|h| (h.priority, h.initiated_at));
        pending
    }
}
