//! Subscription filters

use std::sync::Arc;

use crate::event::{Event, EventTarget};

type Predicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Event filter for selective subscription
///
/// All configured criteria must match. An empty filter matches everything.
#[derive(Clone, Default)]
pub struct EventFilter {
    /// Only events about this task
    pub task_id: Option<String>,
    /// Only events about this worker
    pub agent_id: Option<String>,
    /// Only events published by this source
    pub source: Option<String>,
    /// Only events addressed to this worker (broadcasts included)
    pub target_worker: Option<String>,
    predicate: Option<Predicate>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn agent(mut self, agent_id: &str) -> Self {
        self.agent_id = Some(agent_id.to_string());
        self
    }

    pub fn source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    /// Accept events targeted at `worker_id` or broadcast to all workers
    pub fn addressed_to(mut self, worker_id: &str) -> Self {
        self.target_worker = Some(worker_id.to_string());
        self
    }

    /// Arbitrary predicate, checked after the field criteria
    pub fn predicate<F>(mut self, f: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(f));
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref tid) = self.task_id {
            if event.task_id() != Some(tid.as_str()) {
                return false;
            }
        }

        if let Some(ref aid) = self.agent_id {
            if event.agent_id() != Some(aid.as_str()) {
                return false;
            }
        }

        if let Some(ref source) = self.source {
            if &event.source != source {
                return false;
            }
        }

        if let Some(ref worker) = self.target_worker {
            match &event.target {
                Some(EventTarget::AllWorkers) => {}
                Some(EventTarget::Worker(id)) if id == worker => {}
                _ => return false,
            }
        }

        match &self.predicate {
            Some(predicate) => predicate(event),
            None => true,
        }
    }
}

impl std::fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFilter")
            .field("task_id", &self.task_id)
            .field("agent_id", &self.agent_id)
            .field("source", &self.source)
            .field("target_worker", &self.target_worker)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}
