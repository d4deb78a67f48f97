//! Rolling success ratios per operation category

use async_trait::async_trait;
use baton_core::config::{FidelityConfig, FidelityThresholds};
use baton_core::SharedClock;
use baton_events::{Event, EventChannel, EventHandler, EventPayload, Subscription};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
    ToolExecution,
    AgentCommunication,
    StateTransition,
    ContextPreservation,
    EventProcessing,
}

impl OperationCategory {
    pub const ALL: [OperationCategory; 5] = [
        Self::ToolExecution,
        Self::AgentCommunication,
        Self::StateTransition,
        Self::ContextPreservation,
        Self::EventProcessing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolExecution => "tool_execution",
            Self::AgentCommunication => "agent_communication",
            Self::StateTransition => "state_transition",
            Self::ContextPreservation => "context_preservation",
            Self::EventProcessing => "event_processing",
        }
    }

    /// Floor for this category
    pub fn threshold(&self, thresholds: &FidelityThresholds) -> f64 {
        match self {
            Self::ToolExecution => thresholds.tool_execution,
            Self::AgentCommunication => thresholds.agent_communication,
            Self::StateTransition => thresholds.state_transition,
            Self::ContextPreservation => thresholds.context_preservation,
            Self::EventProcessing => thresholds.event_processing,
        }
    }
}

impl std::fmt::Display for OperationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Most recent outcomes for one category
#[derive(Debug, Default)]
struct Window {
    outcomes: VecDeque<bool>,
    successes: usize,
}

impl Window {
    fn push(&mut self, success: bool, capacity: usize) {
        self.outcomes.push_back(success);
        if success {
            self.successes += 1;
        }
        while self.outcomes.len() > capacity {
            if self.outcomes.pop_front() == Some(true) {
                self.successes -= 1;
            }
        }
    }

    fn rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 1.0;
        }
        self.successes as f64 / self.outcomes.len() as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryFidelity {
    pub category: OperationCategory,
    pub rate: f64,
    pub threshold: f64,
    pub samples: usize,
    pub meets_threshold: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FidelityReport {
    pub categories: Vec<CategoryFidelity>,
    pub all_operations_meet_threshold: bool,
    /// Successes over samples across every category window
    pub overall_rate: f64,
    pub total_samples: u64,
    pub generated_at: DateTime<Utc>,
}

impl FidelityReport {
    pub fn failing(&self) -> impl Iterator<Item = &CategoryFidelity> {
        self.categories.iter().filter(|c| !c.meets_threshold)
    }
}

/// Observes every event and keeps per-category success ratios
pub struct FidelityTracker {
    config: FidelityConfig,
    windows: RwLock<HashMap<OperationCategory, Window>>,
    total_samples: AtomicU64,
    clock: SharedClock,
}

impl FidelityTracker {
    pub fn new(config: FidelityConfig, clock: SharedClock) -> Self {
        Self {
            config,
            windows: RwLock::new(HashMap::new()),
            total_samples: AtomicU64::new(0),
            clock,
        }
    }

    /// Subscribe `tracker` to every event on `channel`
    pub fn attach(tracker: &Arc<Self>, channel: &EventChannel) -> Subscription {
        channel.subscribe_all(tracker.clone(), None)
    }

    pub async fn record(&self, category: OperationCategory, success: bool) {
        let capacity = self.config.window.max(1);
        self.windows
            .write()
            .await
            .entry(category)
            .or_default()
            .push(success, capacity);
        self.total_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Samples an event contributes, as (category, success) pairs
    pub fn classify(event: &Event) -> Vec<(OperationCategory, bool)> {
        use OperationCategory::*;

        let mut samples = Vec::with_capacity(2);
        // Any component reporting a system error counts against event processing
        let system_error = matches!(&event.payload, EventPayload::SystemError(_));
        samples.push((EventProcessing, !system_error));

        match &event.payload {
            EventPayload::ToolExecutionCompleted(_) => samples.push((ToolExecution, true)),
            EventPayload::ToolExecutionFailed(_) => samples.push((ToolExecution, false)),
            EventPayload::AgentCommunicationCompleted(_) => samples.push((AgentCommunication, true)),
            EventPayload::AgentCommunicationFailed(_) => samples.push((AgentCommunication, false)),
            EventPayload::StateTransitionCompleted(_) => samples.push((StateTransition, true)),
            EventPayload::StateTransitionFailed(_) => samples.push((StateTransition, false)),
            EventPayload::ContextPreservationCompleted(_) => samples.push((ContextPreservation, true)),
            EventPayload::ContextPreservationFailed(_) => samples.push((ContextPreservation, false)),
            _ => {}
        }
        samples
    }

    pub async fn observe(&self, event: &Event) {
        for (category, success) in Self::classify(event) {
            self.record(category, success).await;
        }
    }

    /// Success ratio per category; categories without samples report 1.0
    pub async fn rates(&self) -> HashMap<OperationCategory, f64> {
        let windows = self.windows.read().await;
        OperationCategory::ALL
            .iter()
            .map(|c| (*c, windows.get(c).map_or(1.0, Window::rate)))
            .collect()
    }

    pub async fn rate(&self, category: OperationCategory) -> f64 {
        self.windows
            .read()
            .await
            .get(&category)
            .map_or(1.0, Window::rate)
    }

    /// Check every category against the configured floors
    pub async fn validate(&self) -> FidelityReport {
        self.validate_fidelity(&self.config.thresholds).await
    }

    pub async fn validate_fidelity(&self, thresholds: &FidelityThresholds) -> FidelityReport {
        let windows = self.windows.read().await;

        let mut successes = 0usize;
        let mut samples = 0usize;
        let categories: Vec<CategoryFidelity> = OperationCategory::ALL
            .iter()
            .map(|&category| {
                let (rate, count) = match windows.get(&category) {
                    Some(w) => {
                        successes += w.successes;
                        samples += w.outcomes.len();
                        (w.rate(), w.outcomes.len())
                    }
                    None => (1.0, 0),
                };
                let threshold = category.threshold(thresholds);
                CategoryFidelity {
                    category,
                    rate,
                    threshold,
                    samples: count,
                    meets_threshold: rate >= threshold,
                }
            })
            .collect();
        drop(windows);

        let report = FidelityReport {
            all_operations_meet_threshold: categories.iter().all(|c| c.meets_threshold),
            overall_rate: if samples == 0 {
                1.0
            } else {
                successes as f64 / samples as f64
            },
            total_samples: self.total_samples.load(Ordering::Relaxed),
            categories,
            generated_at: self.clock.now(),
        };

        for failing in report.failing() {
            warn!(
                category = %failing.category,
                rate = failing.rate,
                threshold = failing.threshold,
                "Fidelity below threshold"
            );
        }
        report
    }
}

#[async_trait]
impl EventHandler for FidelityTracker {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        debug!(event_type = %event.event_type(), "Fidelity sample");
        self.observe(event).await;
        Ok(())
    }
}
