//! Workflow definition types for Switchyard.
//!
//! `WorkflowDefinition` is the declarative input to the orchestration core: an
//! ordered list of `StageSpec`s whose `depends_on` edges form a DAG. YAML and
//! JSON files both deserialize into it. The definition order of stages is
//! significant: it is the tie-break for the scheduler's ready queue.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A declarative multi-stage workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Per-workflow cap on concurrently running stages (overrides the
    /// scheduler default when set).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallelism: Option<usize>,
    /// Ordered stage list. Order is the ready-queue tie-break.
    pub stages: Vec<StageSpec>,
}

// ---------------------------------------------------------------------------
// Stage Specification
// ---------------------------------------------------------------------------

/// A single stage in the workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// User-defined stage ID (e.g. "summarize"). Unique within a workflow.
    pub id: String,
    /// What the stage does.
    pub kind: StageKind,
    /// Stage IDs this stage depends on (DAG edges).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// JSON payload template. String leaves may reference the run scope with
    /// `{{ input.field }}` or `{{ stages.<id>.output }}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_template: Option<serde_json::Value>,
    /// Retry policy override for this stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Optional JEXL expression; when it evaluates falsy the stage is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Per-attempt timeout in milliseconds (overrides the kind default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Become ready even when an upstream stage failed or was cancelled.
    #[serde(default, skip_serializing_if = "is_false")]
    pub continue_on_failure: bool,
    /// A failed optional stage does not fail the run.
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl StageSpec {
    /// Build a stage with the given ID and kind and no other settings.
    pub fn new(id: impl Into<String>, kind: StageKind) -> Self {
        Self {
            id: id.into(),
            kind,
            depends_on: Vec::new(),
            input_template: None,
            retry: None,
            condition: None,
            timeout_ms: None,
            continue_on_failure: false,
            optional: false,
        }
    }

    /// Builder-style helper to set dependencies.
    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// The kind of work a stage performs.
///
/// Internally tagged by `type` to match YAML structure:
/// ```yaml
/// kind:
///   type: inference
///   capability: chat
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageKind {
    /// A model call routed to one of the registered nodes.
    Inference {
        /// Only nodes advertising this capability are candidates.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capability: Option<String>,
        /// Pin the call to a specific node, bypassing health ranking.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node: Option<String>,
    },
    /// A call to the external tool collaborator.
    Tool { tool: String },
    /// A JEXL expression evaluated over the run scope; never calls a backend.
    Branch { expression: String },
}

impl StageKind {
    /// Short lowercase label used in logs and events.
    pub fn label(&self) -> &'static str {
        match self {
            StageKind::Inference { .. } => "inference",
            StageKind::Tool { .. } => "tool",
            StageKind::Branch { .. } => "branch",
        }
    }
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Retry configuration for transient stage failures.
///
/// Total attempts for one stage invocation never exceed `max_retries + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt (default 2).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds (default 200).
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on any single backoff delay in milliseconds (default 2000).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Exponential growth factor between retries (default 2.0).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Maximum number of attempts (first call plus retries).
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
