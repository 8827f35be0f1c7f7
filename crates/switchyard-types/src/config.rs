//! Orchestrator configuration types.
//!
//! `OrchestratorConfig` represents the `switchyard.toml` that controls
//! scheduling limits, stage timeouts and retry defaults, health thresholds,
//! and statically registered nodes. Every field has a default, so an empty
//! file is a valid configuration.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::node::ModelNode;
use crate::workflow::RetryPolicy;

/// Top-level configuration for the orchestration core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub stage: StageConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub events: EventConfig,
    /// Nodes registered at startup.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl OrchestratorConfig {
    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_parallelism == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_parallelism must be at least 1".to_string(),
            ));
        }
        if self.scheduler.global_max_concurrent_stages == Some(0) {
            return Err(ConfigError::Invalid(
                "scheduler.global_max_concurrent_stages must be at least 1".to_string(),
            ));
        }
        if !(self.health.error_rate_threshold > 0.0 && self.health.error_rate_threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "health.error_rate_threshold must be in (0, 1], got {}",
                self.health.error_rate_threshold
            )));
        }
        if self.health.window_capacity == 0 {
            return Err(ConfigError::Invalid(
                "health.window_capacity must be at least 1".to_string(),
            ));
        }
        if self.stage.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "stage.retry.multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.events.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "events.channel_capacity must be at least 1".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "node '{}' is declared more than once",
                    node.id
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum concurrently running stages per run (default 4).
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    /// Cap on concurrent backend calls across all runs (None = unlimited).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_max_concurrent_stages: Option<usize>,
    /// How long finished runs stay queryable before eviction (default 1h).
    #[serde(default = "default_run_retention_secs")]
    pub run_retention_secs: u64,
}

fn default_max_parallelism() -> usize {
    4
}

fn default_run_retention_secs() -> u64 {
    3_600
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
            global_max_concurrent_stages: None,
            run_retention_secs: default_run_retention_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Default per-attempt timeout for inference stages (default 30s).
    #[serde(default = "default_timeout_ms")]
    pub inference_timeout_ms: u64,
    /// Default per-attempt timeout for tool stages (default 30s).
    #[serde(default = "default_timeout_ms")]
    pub tool_timeout_ms: u64,
    /// Retry policy for stages that do not declare one.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            inference_timeout_ms: default_timeout_ms(),
            tool_timeout_ms: default_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Maximum samples kept per node (default 200).
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    /// Samples older than this are evicted (default 300s).
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Error rate above which a node flips unhealthy (default 0.2).
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    /// Samples required before the error rate can flip a node (default 5).
    #[serde(default = "default_min_samples")]
    pub min_samples_for_error_rate: usize,
    /// Consecutive failures that flip a node regardless of rate (default 3).
    #[serde(default = "default_consecutive_failure_threshold")]
    pub consecutive_failure_threshold: u32,
    /// Minimum time a node stays unhealthy before a success restores it (default 30s).
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Successful samples required for P50/P95 to be known (default 5).
    #[serde(default = "default_min_samples")]
    pub min_latency_samples: usize,
}

fn default_window_capacity() -> usize {
    200
}

fn default_window_secs() -> u64 {
    300
}

fn default_error_rate_threshold() -> f64 {
    0.2
}

fn default_min_samples() -> usize {
    5
}

fn default_consecutive_failure_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    30
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_capacity: default_window_capacity(),
            window_secs: default_window_secs(),
            error_rate_threshold: default_error_rate_threshold(),
            min_samples_for_error_rate: default_min_samples(),
            consecutive_failure_threshold: default_consecutive_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            min_latency_samples: default_min_samples(),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventConfig {
    /// Broadcast channel capacity (default 1024).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    1_024
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

// ---------------------------------------------------------------------------
// Static nodes
// ---------------------------------------------------------------------------

/// A node declared in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub endpoint: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<u32>,
    /// Artificial latency used by simulated backends (CLI dry runs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulated_latency_ms: Option<u64>,
}

impl NodeConfig {
    pub fn to_model_node(&self) -> ModelNode {
        ModelNode {
            node_id: self.id.clone(),
            endpoint_ref: self.endpoint.clone(),
            capabilities: self.capabilities.clone(),
            max_in_flight: self.max_in_flight,
        }
    }
}
