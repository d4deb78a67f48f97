//! Configuration management for Baton
//!
//! Every window, limit and threshold the components use is configurable here
//! rather than hidden in constants. Missing sections and fields fall back to
//! defaults, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::{BatonError, Result};

/// Repository-level Baton configuration
///
/// Loaded from `.baton/config.toml` in the repo root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatonConfig {
    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub consensus: ConsensusConfig,

    #[serde(default)]
    pub handoff: HandoffConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub fidelity: FidelityConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Event channel dispatch limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Maximum events dispatching concurrently
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

/// Task router scoring and routing-memory settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// How long a routing decision stays reusable
    #[serde(default = "default_memory_window_secs")]
    pub memory_window_secs: u64,

    /// Routing memory size before oldest-first eviction
    #[serde(default = "default_max_memory_entries")]
    pub max_memory_entries: usize,

    /// Weight of expertise match in the routing score
    #[serde(default = "default_expertise_weight")]
    pub expertise_weight: f64,

    /// Weight of spare capacity in the routing score
    #[serde(default = "default_workload_weight")]
    pub workload_weight: f64,

    /// Confidence reported for sticky (memory) routing
    #[serde(default = "default_sticky_confidence")]
    pub sticky_confidence: f64,

    /// Confidence reported when every worker is at capacity
    #[serde(default = "default_overload_confidence")]
    pub overload_confidence: f64,
}

/// Consensus engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Votes from different workers closer than this are flagged as conflicts
    #[serde(default = "default_conflict_window_ms")]
    pub conflict_window_ms: u64,

    /// Threshold used by supermajority and consensus-threshold when none is given
    #[serde(default = "default_supermajority_threshold")]
    pub default_threshold: f64,
}

/// Context handoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffConfig {
    /// Initiated handoffs older than this are failed by `expire_stale_handoffs`
    #[serde(default = "default_handoff_timeout_secs")]
    pub timeout_secs: u64,

    /// Completed or failed handoffs older than this are dropped by `prune_settled`
    #[serde(default = "default_handoff_retention_secs")]
    pub retention_secs: u64,
}

/// Retry and backoff defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Extra attempts after the first failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay; doubles on each attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any single backoff delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Fidelity floors and sample window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FidelityConfig {
    /// Samples kept per category for rolling rates
    #[serde(default = "default_fidelity_window")]
    pub window: usize,

    #[serde(default)]
    pub thresholds: FidelityThresholds,
}

/// Minimum acceptable success ratio per operation category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FidelityThresholds {
    #[serde(default = "default_tool_execution_floor")]
    pub tool_execution: f64,

    #[serde(default = "default_agent_communication_floor")]
    pub agent_communication: f64,

    #[serde(default = "default_state_transition_floor")]
    pub state_transition: f64,

    #[serde(default = "default_context_preservation_floor")]
    pub context_preservation: f64,

    #[serde(default = "default_event_processing_floor")]
    pub event_processing: f64,
}

/// Worker execution pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Tasks executing concurrently across all workers
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

// Default value providers
fn default_max_in_flight() -> usize {
    4
}

fn default_memory_window_secs() -> u64 {
    600
}

fn default_max_memory_entries() -> usize {
    1000
}

fn default_expertise_weight() -> f64 {
    0.8
}

fn default_workload_weight() -> f64 {
    0.2
}

fn default_sticky_confidence() -> f64 {
    0.9
}

fn default_overload_confidence() -> f64 {
    0.3
}

fn default_conflict_window_ms() -> u64 {
    100
}

fn default_supermajority_threshold() -> f64 {
    0.67
}

fn default_handoff_timeout_secs() -> u64 {
    300
}

fn default_handoff_retention_secs() -> u64 {
    3600
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_fidelity_window() -> usize {
    10_000
}

fn default_tool_execution_floor() -> f64 {
    0.99
}

fn default_agent_communication_floor() -> f64 {
    0.99
}

fn default_state_transition_floor() -> f64 {
    0.98
}

fn default_context_preservation_floor() -> f64 {
    0.99
}

fn default_event_processing_floor() -> f64 {
    0.95
}

fn default_max_parallel() -> usize {
    4
}

impl BatonConfig {
    /// Load configuration from `.baton/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(".baton/config.toml");

        if config_path.exists() {
            debug!(path = %config_path.display(), "Loading config");
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)
        } else {
            debug!(path = %config_path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| BatonError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write default configuration to `.baton/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<()> {
        let config_dir = repo_root.join(".baton");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        std::fs::write(&config_path, Self::default().to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| BatonError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Reject values that would break component invariants
    pub fn validate(&self) -> Result<()> {
        if self.events.max_in_flight == 0 {
            return Err(BatonError::Config("events.max_in_flight must be at least 1".into()));
        }
        if self.execution.max_parallel == 0 {
            return Err(BatonError::Config("execution.max_parallel must be at least 1".into()));
        }
        if self.router.max_memory_entries == 0 {
            return Err(BatonError::Config("router.max_memory_entries must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.consensus.default_threshold) {
            return Err(BatonError::Config(
                "consensus.default_threshold must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

impl RouterConfig {
    pub fn memory_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.memory_window_secs as i64)
    }
}

impl ConsensusConfig {
    pub fn conflict_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.conflict_window_ms as i64)
    }
}

impl HandoffConfig {
    pub fn timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.timeout_secs as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs as i64)
    }
}

impl RecoveryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            memory_window_secs: default_memory_window_secs(),
            max_memory_entries: default_max_memory_entries(),
            expertise_weight: default_expertise_weight(),
            workload_weight: default_workload_weight(),
            sticky_confidence: default_sticky_confidence(),
            overload_confidence: default_overload_confidence(),
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            conflict_window_ms: default_conflict_window_ms(),
            default_threshold: default_supermajority_threshold(),
        }
    }
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_handoff_timeout_secs(),
            retention_secs: default_handoff_retention_secs(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for FidelityConfig {
    fn default() -> Self {
        Self {
            window: default_fidelity_window(),
            thresholds: FidelityThresholds::default(),
        }
    }
}

impl Default for FidelityThresholds {
    fn default() -> Self {
        Self {
            tool_execution: default_tool_execution_floor(),
            agent_communication: default_agent_communication_floor(),
            state_transition: default_state_transition_floor(),
            context_preservation: default_context_preservation_floor(),
            event_processing: default_event_processing_floor(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = BatonConfig::from_toml("").unwrap();
        assert_eq!(config.events.max_in_flight, 4);
        assert_eq!(config.router.memory_window_secs, 600);
        assert_eq!(config.consensus.conflict_window_ms, 100);
        assert_eq!(config.fidelity.thresholds.event_processing, 0.95);
    }

    #[test]
    fn test_partial_section_override() {
        let config = BatonConfig::from_toml(
            r#"
            [router]
            max_memory_entries = 50

            [recovery]
            base_delay_ms = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.router.max_memory_entries, 50);
        assert_eq!(config.router.sticky_confidence, 0.9);
        assert_eq!(config.recovery.base_delay(), Duration::from_millis(10));
        assert_eq!(config.recovery.max_retries, 3);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = BatonConfig::from_toml("[events]\nmax_in_flight = 0\n").unwrap_err();
        assert!(matches!(err, BatonError::Config(_)));
    }

    #[test]
    fn test_write_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        BatonConfig::write_default(dir.path()).unwrap();
        assert!(dir.path().join(".baton/config.toml").exists());

        let loaded = BatonConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.handoff.timeout_secs, 300);
        assert_eq!(loaded.handoff.retention_secs, 3600);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = BatonConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.execution.max_parallel, 4);
    }
}
