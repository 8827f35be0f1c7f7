//! Workflow definition parsing, validation, and file loading.
//!
//! Converts YAML or JSON into `WorkflowDefinition` and checks the structural
//! constraints that do not need the dependency graph (names, ids, stage kind
//! settings, retry sanity). Graph constraints (duplicates, dangling edges,
//! cycles) are enforced by [`WorkflowGraph::compile`](super::graph::WorkflowGraph::compile).

use std::path::Path;

use switchyard_types::error::WorkflowError;
use switchyard_types::workflow::{RetryPolicy, StageKind, WorkflowDefinition};

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::Parse(e.to_string()))
}

/// Load a workflow file. `.json` files are parsed as JSON, anything else as
/// YAML.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| WorkflowError::Io(format!("{}: {e}", path.display())))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        parse_workflow_json(&content)
    } else {
        parse_workflow_yaml(&content)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty
/// - At least one stage exists
/// - Stage IDs are non-empty
/// - Tool stages name a tool, branch stages carry an expression
/// - Retry policies have `multiplier >= 1` and `initial <= max` backoff
/// - `max_parallelism >= 1` if set
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.trim().is_empty() {
        return Err(WorkflowError::Validation(
            "workflow name must not be empty".to_string(),
        ));
    }

    if def.stages.is_empty() {
        return Err(WorkflowError::Validation(
            "workflow must have at least one stage".to_string(),
        ));
    }

    if def.max_parallelism == Some(0) {
        return Err(WorkflowError::Validation(
            "max_parallelism must be >= 1".to_string(),
        ));
    }

    for stage in &def.stages {
        if stage.id.trim().is_empty() {
            return Err(WorkflowError::Validation(
                "stage id must not be empty".to_string(),
            ));
        }

        match &stage.kind {
            StageKind::Tool { tool } if tool.trim().is_empty() => {
                return Err(WorkflowError::Validation(format!(
                    "tool stage '{}' must name a tool",
                    stage.id
                )));
            }
            StageKind::Branch { expression } if expression.trim().is_empty() => {
                return Err(WorkflowError::Validation(format!(
                    "branch stage '{}' must have an expression",
                    stage.id
                )));
            }
            _ => {}
        }

        if stage.condition.as_deref().is_some_and(|c| c.trim().is_empty()) {
            return Err(WorkflowError::Validation(format!(
                "stage '{}' has an empty condition",
                stage.id
            )));
        }

        if stage.timeout_ms == Some(0) {
            return Err(WorkflowError::Validation(format!(
                "stage '{}' timeout must be > 0",
                stage.id
            )));
        }

        if let Some(policy) = &stage.retry {
            validate_retry_policy(&stage.id, policy)?;
        }
    }

    Ok(())
}

fn validate_retry_policy(stage_id: &str, policy: &RetryPolicy) -> Result<(), WorkflowError> {
    if policy.multiplier < 1.0 || !policy.multiplier.is_finite() {
        return Err(WorkflowError::Validation(format!(
            "stage '{stage_id}' retry multiplier must be >= 1.0"
        )));
    }
    if policy.initial_backoff_ms > policy.max_backoff_ms {
        return Err(WorkflowError::Validation(format!(
            "stage '{stage_id}' initial backoff exceeds max backoff"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
