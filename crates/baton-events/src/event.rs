//! Event types carried on the channel
//!
//! Each [`EventPayload`] variant *is* one event type; the dotted wire name
//! (`handoff.initiated`, `system.error`, ...) is the serde tag.

use baton_core::{DecisionSource, Priority, Task, TaskId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discriminant used for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.routed")]
    TaskRouted,
    #[serde(rename = "handoff.initiated")]
    HandoffInitiated,
    #[serde(rename = "handoff.completed")]
    HandoffCompleted,
    #[serde(rename = "handoff.failed")]
    HandoffFailed,
    #[serde(rename = "consensus.resolved")]
    ConsensusResolved,
    #[serde(rename = "consensus.conflict")]
    ConflictDetected,
    #[serde(rename = "tool.execution.completed")]
    ToolExecutionCompleted,
    #[serde(rename = "tool.execution.failed")]
    ToolExecutionFailed,
    #[serde(rename = "agent.communication.completed")]
    AgentCommunicationCompleted,
    #[serde(rename = "agent.communication.failed")]
    AgentCommunicationFailed,
    #[serde(rename = "state.transition.completed")]
    StateTransitionCompleted,
    #[serde(rename = "state.transition.failed")]
    StateTransitionFailed,
    #[serde(rename = "context.preservation.completed")]
    ContextPreservationCompleted,
    #[serde(rename = "context.preservation.failed")]
    ContextPreservationFailed,
    #[serde(rename = "system.error")]
    SystemError,
    #[serde(rename = "performance.metric")]
    PerformanceMetric,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCreated => "task.created",
            Self::TaskRouted => "task.routed",
            Self::HandoffInitiated => "handoff.initiated",
            Self::HandoffCompleted => "handoff.completed",
            Self::HandoffFailed => "handoff.failed",
            Self::ConsensusResolved => "consensus.resolved",
            Self::ConflictDetected => "consensus.conflict",
            Self::ToolExecutionCompleted => "tool.execution.completed",
            Self::ToolExecutionFailed => "tool.execution.failed",
            Self::AgentCommunicationCompleted => "agent.communication.completed",
            Self::AgentCommunicationFailed => "agent.communication.failed",
            Self::StateTransitionCompleted => "state.transition.completed",
            Self::StateTransitionFailed => "state.transition.failed",
            Self::ContextPreservationCompleted => "context.preservation.completed",
            Self::ContextPreservationFailed => "context.preservation.failed",
            Self::SystemError => "system.error",
            Self::PerformanceMetric => "performance.metric",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery target the transport layer should honour
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventTarget {
    /// Broadcast to every worker
    AllWorkers,
    /// A single worker
    Worker(WorkerId),
}

impl std::fmt::Display for EventTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllWorkers => write!(f, "all-workers"),
            Self::Worker(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCreated {
    pub task_id: TaskId,
    pub description: String,
    pub category: String,
    pub priority: Priority,
    pub context: serde_json::Value,
}

impl From<&Task> for TaskCreated {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            description: task.description.clone(),
            category: task.category.clone(),
            priority: task.priority,
            context: task.context.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRouted {
    pub task_id: TaskId,
    pub agent_id: WorkerId,
    pub confidence: f64,
    pub rationale: String,
    pub source: DecisionSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffInitiated {
    pub handoff_id: String,
    pub source_agent_id: WorkerId,
    pub target_agent_id: WorkerId,
    pub task_id: TaskId,
    pub context: serde_json::Value,
    pub priority: Priority,
}

/// Completion or failure of a handoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffSettled {
    pub handoff_id: String,
    pub task_id: TaskId,
    pub source_agent_id: WorkerId,
    pub target_agent_id: WorkerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusResolved {
    pub session_id: String,
    pub topic: String,
    pub winning_option: Option<String>,
    pub confidence: f64,
    pub consensus_reached: bool,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetected {
    pub conflict_id: String,
    pub session_id: String,
    pub kind: String,
    pub agent_ids: Vec<WorkerId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecution {
    pub tool_name: String,
    pub task_id: TaskId,
    pub agent_id: WorkerId,
    pub success: bool,
    /// Milliseconds
    pub execution_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Generic success/failure record for a tracked operation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationOutcome {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemError {
    pub error: String,
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<WorkerId>,
}

impl SystemError {
    pub fn new(component: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            component: component.into(),
            task_id: None,
            agent_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetric {
    pub metric: String,
    pub value: f64,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<WorkerId>,
}

/// Event body, tagged by its wire event type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventPayload {
    #[serde(rename = "task.created")]
    TaskCreated(TaskCreated),
    #[serde(rename = "task.routed")]
    TaskRouted(TaskRouted),
    #[serde(rename = "handoff.initiated")]
    HandoffInitiated(HandoffInitiated),
    #[serde(rename = "handoff.completed")]
    HandoffCompleted(HandoffSettled),
    #[serde(rename = "handoff.failed")]
    HandoffFailed(HandoffSettled),
    #[serde(rename = "consensus.resolved")]
    ConsensusResolved(ConsensusResolved),
    #[serde(rename = "consensus.conflict")]
    ConflictDetected(ConflictDetected),
    #[serde(rename = "tool.execution.completed")]
    ToolExecutionCompleted(ToolExecution),
    #[serde(rename = "tool.execution.failed")]
    ToolExecutionFailed(ToolExecution),
    #[serde(rename = "agent.communication.completed")]
    AgentCommunicationCompleted(OperationOutcome),
    #[serde(rename = "agent.communication.failed")]
    AgentCommunicationFailed(OperationOutcome),
    #[serde(rename = "state.transition.completed")]
    StateTransitionCompleted(OperationOutcome),
    #[serde(rename = "state.transition.failed")]
    StateTransitionFailed(OperationOutcome),
    #[serde(rename = "context.preservation.completed")]
    ContextPreservationCompleted(OperationOutcome),
    #[serde(rename = "context.preservation.failed")]
    ContextPreservationFailed(OperationOutcome),
    #[serde(rename = "system.error")]
    SystemError(SystemError),
    #[serde(rename = "performance.metric")]
    PerformanceMetric(PerformanceMetric),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::TaskCreated(_) => EventType::TaskCreated,
            Self::TaskRouted(_) => EventType::TaskRouted,
            Self::HandoffInitiated(_) => EventType::HandoffInitiated,
            Self::HandoffCompleted(_) => EventType::HandoffCompleted,
            Self::HandoffFailed(_) => EventType::HandoffFailed,
            Self::ConsensusResolved(_) => EventType::ConsensusResolved,
            Self::ConflictDetected(_) => EventType::ConflictDetected,
            Self::ToolExecutionCompleted(_) => EventType::ToolExecutionCompleted,
            Self::ToolExecutionFailed(_) => EventType::ToolExecutionFailed,
            Self::AgentCommunicationCompleted(_) => EventType::AgentCommunicationCompleted,
            Self::AgentCommunicationFailed(_) => EventType::AgentCommunicationFailed,
            Self::StateTransitionCompleted(_) => EventType::StateTransitionCompleted,
            Self::StateTransitionFailed(_) => EventType::StateTransitionFailed,
            Self::ContextPreservationCompleted(_) => EventType::ContextPreservationCompleted,
            Self::ContextPreservationFailed(_) => EventType::ContextPreservationFailed,
            Self::SystemError(_) => EventType::SystemError,
            Self::PerformanceMetric(_) => EventType::PerformanceMetric,
        }
    }

    /// `tool.execution.completed` or `tool.execution.failed` depending on `success`
    pub fn tool_execution(execution: ToolExecution) -> Self {
        if execution.success {
            Self::ToolExecutionCompleted(execution)
        } else {
            Self::ToolExecutionFailed(execution)
        }
    }

    pub fn agent_communication(outcome: OperationOutcome) -> Self {
        if outcome.error.is_none() {
            Self::AgentCommunicationCompleted(outcome)
        } else {
            Self::AgentCommunicationFailed(outcome)
        }
    }

    pub fn state_transition(outcome: OperationOutcome) -> Self {
        if outcome.error.is_none() {
            Self::StateTransitionCompleted(outcome)
        } else {
            Self::StateTransitionFailed(outcome)
        }
    }

    pub fn context_preservation(outcome: OperationOutcome) -> Self {
        if outcome.error.is_none() {
            Self::ContextPreservationCompleted(outcome)
        } else {
            Self::ContextPreservationFailed(outcome)
        }
    }

    /// Task the event concerns, if any
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskCreated(p) => Some(&p.task_id),
            Self::TaskRouted(p) => Some(&p.task_id),
            Self::HandoffInitiated(p) => Some(&p.task_id),
            Self::HandoffCompleted(p) | Self::HandoffFailed(p) => Some(&p.task_id),
            Self::ToolExecutionCompleted(p) | Self::ToolExecutionFailed(p) => Some(&p.task_id),
            Self::AgentCommunicationCompleted(p)
            | Self::AgentCommunicationFailed(p)
            | Self::StateTransitionCompleted(p)
            | Self::StateTransitionFailed(p)
            | Self::ContextPreservationCompleted(p)
            | Self::ContextPreservationFailed(p) => p.task_id.as_deref(),
            Self::SystemError(p) => p.task_id.as_deref(),
            Self::PerformanceMetric(p) => p.task_id.as_deref(),
            Self::ConsensusResolved(_) | Self::ConflictDetected(_) => None,
        }
    }

    /// Worker the event concerns, if any
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::TaskRouted(p) => Some(&p.agent_id),
            Self::HandoffInitiated(p) => Some(&p.target_agent_id),
            Self::HandoffCompleted(p) | Self::HandoffFailed(p) => Some(&p.target_agent_id),
            Self::ToolExecutionCompleted(p) | Self::ToolExecutionFailed(p) => Some(&p.agent_id),
            Self::AgentCommunicationCompleted(p)
            | Self::AgentCommunicationFailed(p)
            | Self::StateTransitionCompleted(p)
            | Self::StateTransitionFailed(p)
            | Self::ContextPreservationCompleted(p)
            | Self::ContextPreservationFailed(p) => p.agent_id.as_deref(),
            Self::SystemError(p) => p.agent_id.as_deref(),
            Self::PerformanceMetric(p) => p.agent_id.as_deref(),
            Self::TaskCreated(_) | Self::ConsensusResolved(_) | Self::ConflictDetected(_) => None,
        }
    }
}

/// An event as delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    /// Component or caller that published the event
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<EventTarget>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        timestamp: DateTime<Utc>,
        payload: EventPayload,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            timestamp,
            target: None,
            payload,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    pub fn task_id(&self) -> Option<&str> {
        self.payload.task_id()
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.payload.agent_id()
    }

    /// Apply the declarative routing rules
    ///
    /// `handoff.initiated` goes to its target worker, `system.error` is
    /// broadcast. Any other event keeps whatever target it already has.
    pub fn routed(mut self) -> Self {
        match &self.payload {
            EventPayload::HandoffInitiated(p) => {
                self.target = Some(EventTarget::Worker(p.target_agent_id.clone()));
            }
            EventPayload::SystemError(_) => {
                self.target = Some(EventTarget::AllWorkers);
            }
            _ => {}
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handoff_payload() -> EventPayload {
        EventPayload::HandoffInitiated(HandoffInitiated {
            handoff_id: "handoff-1".to_string(),
            source_agent_id: "w-1".to_string(),
            target_agent_id: "w-2".to_string(),
            task_id: "t-1".to_string(),
            context: serde_json::json!({"step": 3}),
            priority: Priority::High,
        })
    }

    #[test]
    fn test_routing_rules() {
        let handoff = Event::new("e-1", "handoff", Utc::now(), handoff_payload()).routed();
        assert_eq!(handoff.target, Some(EventTarget::Worker("w-2".to_string())));

        let error = Event::new(
            "e-2",
            "router",
            Utc::now(),
            EventPayload::SystemError(SystemError::new("router", "boom")),
        )
        .routed();
        assert_eq!(error.target, Some(EventTarget::AllWorkers));
        assert_eq!(error.target.unwrap().to_string(), "all-workers");
    }

    #[test]
    fn test_wire_format_uses_dotted_type() {
        let event = Event::new("e-1", "handoff", Utc::now(), handoff_payload()).routed();
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "handoff.initiated");
        assert_eq!(json["payload"]["targetAgentId"], "w-2");
        assert_eq!(json["target"]["worker"], "w-2");

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_tool_execution_variant_follows_success() {
        let failed = EventPayload::tool_execution(ToolExecution {
            tool_name: "compile".to_string(),
            task_id: "t-1".to_string(),
            agent_id: "w-1".to_string(),
            success: false,
            execution_time: 12,
            error: Some("exit 1".to_string()),
        });
        assert_eq!(failed.event_type(), EventType::ToolExecutionFailed);
        assert_eq!(failed.agent_id(), Some("w-1"));
    }
}
