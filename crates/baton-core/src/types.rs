//! Core type definitions for Baton orchestration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker (agent) identifier
pub type WorkerId = String;

/// Task identifier
pub type TaskId = String;

/// Task priority levels
///
/// Lower sorts first: `Critical` is dispatched before `Low`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Medium = 2,
    Low = 3,
}

impl Priority {
    /// Numeric rank, 0 (critical) through 3 (low)
    pub fn rank(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" | "0" => Ok(Self::Critical),
            "high" | "1" => Ok(Self::High),
            "medium" | "2" => Ok(Self::Medium),
            "low" | "3" => Ok(Self::Low),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// A registered executor capable of handling tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    /// Unique worker identifier
    pub id: WorkerId,
    /// Category of worker (e.g. "coder", "reviewer")
    pub kind: String,
    /// Human-readable name
    pub name: String,
    /// Ordered expertise tags
    pub expertise: Vec<String>,
    /// Tasks currently assigned
    pub workload: u32,
    /// Maximum concurrent tasks
    pub capacity: u32,
}

impl Worker {
    pub fn new(id: impl Into<String>, name: impl Into<String>, capacity: u32) -> Self {
        Self {
            id: id.into(),
            kind: "general".to_string(),
            name: name.into(),
            expertise: Vec::new(),
            workload: 0,
            capacity,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Set expertise tags, dropping duplicates while keeping first-seen order
    pub fn with_expertise<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expertise.clear();
        for tag in tags {
            let tag = tag.into();
            if !self.expertise.contains(&tag) {
                self.expertise.push(tag);
            }
        }
        self
    }

    pub fn with_workload(mut self, workload: u32) -> Self {
        self.workload = workload;
        self
    }

    /// Whether the worker can accept another task
    pub fn has_capacity(&self) -> bool {
        self.workload < self.capacity
    }

    /// Fraction of capacity still free (0.0 - 1.0)
    pub fn workload_factor(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (1.0 - self.workload as f64 / self.capacity as f64).clamp(0.0, 1.0)
    }
}

/// A unit of work
///
/// Tasks are immutable once created; a handoff produces a new task value
/// carrying the replaced context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub category: String,
    pub priority: Priority,
    /// Opaque context payload accumulated across handoffs
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            category: "general".to_string(),
            priority: Priority::default(),
            context: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// How a routing decision was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Expertise/workload scoring
    Scored,
    /// Reused from routing memory
    Memory,
    /// Every worker was at capacity; least-loaded chosen
    Overload,
}

impl std::fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scored => write!(f, "scored"),
            Self::Memory => write!(f, "memory"),
            Self::Overload => write!(f, "overload"),
        }
    }
}

/// Outcome of routing a task to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub rationale: String,
    pub source: DecisionSource,
    pub decided_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Medium < Priority::Low);
        assert_eq!(Priority::Low.rank(), 3);
    }

    #[test]
    fn test_priority_parsing() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("0".parse::<Priority>().unwrap(), Priority::Critical);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_worker_expertise_dedup() {
        let worker = Worker::new("w-1", "Ada", 2).with_expertise(["rust", "sql", "rust"]);
        assert_eq!(worker.expertise, vec!["rust", "sql"]);
    }

    #[test]
    fn test_workload_factor() {
        let worker = Worker::new("w-1", "Ada", 4).with_workload(1);
        assert!((worker.workload_factor() - 0.75).abs() < f64::EPSILON);
        assert!(worker.has_capacity());

        let full = Worker::new("w-2", "Bob", 2).with_workload(2);
        assert_eq!(full.workload_factor(), 0.0);
        assert!(!full.has_capacity());
    }

    #[test]
    fn test_task_serializes_camel_case() {
        let task = Task::new("t-1", "Fix login").with_priority(Priority::High);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["priority"], "high");
        assert!(json.get("createdAt").is_some());
    }
}
