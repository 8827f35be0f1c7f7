use thiserror::Error;
use uuid::Uuid;

use crate::run::RunOutcome;

/// Errors that make a workflow definition unusable.
///
/// All variants are detected before any run starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("duplicate stage id '{0}'")]
    DuplicateStageId(String),

    #[error("stage '{stage_id}' depends on unknown stage '{dependency}'")]
    DanglingDependency { stage_id: String, dependency: String },

    #[error("cycle detected involving stage '{stage_id}'")]
    CyclicGraph { stage_id: String },

    #[error("I/O error: {0}")]
    Io(String),
}

/// Errors returned by the inference and tool collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The backend could not be reached or is overloaded.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected the payload.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The backend accepted the call but it failed.
    #[error("execution failed: {0}")]
    Execution(String),
}

/// Typed failure of a single stage invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("node '{node_id}' unavailable: {message}")]
    NodeUnavailable { node_id: String, message: String },

    #[error("stage '{stage_id}' timed out after {timeout_ms}ms")]
    StageTimeout { stage_id: String, timeout_ms: u64 },

    #[error("tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no available node: {reason}")]
    RouterNoAvailableNode { reason: String, retryable: bool },

    #[error("stage cancelled")]
    Cancelled,
}

impl StageError {
    /// Whether the retry policy applies to this failure.
    ///
    /// Transient: node unavailable, timeout, and router exhaustion when a
    /// node may free up. Semantic failures fail the stage immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            StageError::NodeUnavailable { .. } | StageError::StageTimeout { .. } => true,
            StageError::RouterNoAvailableNode { retryable, .. } => *retryable,
            StageError::ToolExecution { .. }
            | StageError::InvalidInput(_)
            | StageError::Cancelled => false,
        }
    }
}

/// Errors from the run control API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("unknown run id: {0}")]
    UnknownRunId(Uuid),

    #[error("run {run_id} is {outcome}, cannot {operation}")]
    InvalidRunState {
        run_id: Uuid,
        outcome: RunOutcome,
        operation: &'static str,
    },

    #[error("invalid workflow definition: {0}")]
    InvalidWorkflowDefinition(#[from] WorkflowError),
}

/// Errors from configuration parsing and validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}
