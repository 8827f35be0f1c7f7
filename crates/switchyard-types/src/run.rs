//! Pipeline run state types.
//!
//! A `PipelineRun` is the externally visible snapshot of one execution of a
//! compiled workflow. The scheduler that created the run is its only writer;
//! everyone else receives clones of these snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Stage Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Ready,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StageStatus {
    /// Whether the stage has reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded
                | StageStatus::Failed
                | StageStatus::Skipped
                | StageStatus::Cancelled
        )
    }

    /// Whether the stage currently occupies a concurrency slot.
    pub fn is_active(self) -> bool {
        matches!(self, StageStatus::Running | StageStatus::Retrying)
    }

    /// Allowed transitions of the per-stage state machine.
    ///
    /// `Pending`/`Ready` may go to `Skipped` (upstream failure, unmet
    /// condition, or run cancellation before dispatch). `Pending` may go
    /// straight to `Failed` when its condition cannot be evaluated.
    pub fn can_transition_to(self, next: StageStatus) -> bool {
        use StageStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Pending, Failed)
                | (Ready, Running)
                | (Ready, Skipped)
                | (Running, Retrying)
                | (Retrying, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Retrying, Succeeded)
                | (Retrying, Failed)
                | (Retrying, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Ready => "ready",
            StageStatus::Running => "running",
            StageStatus::Retrying => "retrying",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
            StageStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Run Outcome
// ---------------------------------------------------------------------------

/// Aggregate status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunOutcome {
    pub fn is_finished(self) -> bool {
        !matches!(self, RunOutcome::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Running => "running",
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Stage Record
// ---------------------------------------------------------------------------

/// Per-stage execution record inside a `PipelineRun` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage ID matching `StageSpec.id`.
    pub stage_id: String,
    /// Current status.
    pub status: StageStatus,
    /// Number of backend calls attempted so far.
    pub attempts: u32,
    /// Node used by the most recent inference attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Output produced on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Failure or skip reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    pub fn pending(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            status: StageStatus::Pending,
            attempts: 0,
            node_id: None,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline Run
// ---------------------------------------------------------------------------

/// Snapshot of one execution of a compiled workflow.
///
/// `stages` is kept in workflow definition order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// UUIDv7 run ID.
    pub run_id: Uuid,
    /// Name of the workflow being executed.
    pub workflow_name: String,
    /// Per-stage records in definition order.
    pub stages: Vec<StageRecord>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Aggregate outcome (`Running` until finished).
    pub outcome: RunOutcome,
    /// Whether cancellation has been requested.
    #[serde(default)]
    pub cancel_requested: bool,
}

impl PipelineRun {
    /// Look up a stage record by ID.
    pub fn stage(&self, stage_id: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }

    /// Status of a stage, if the stage exists.
    pub fn status_of(&self, stage_id: &str) -> Option<StageStatus> {
        self.stage(stage_id).map(|s| s.status)
    }

    /// Statuses in definition order.
    pub fn statuses(&self) -> Vec<StageStatus> {
        self.stages.iter().map(|s| s.status).collect()
    }

    /// Number of stages currently occupying a concurrency slot.
    pub fn active_count(&self) -> usize {
        self.stages.iter().filter(|s| s.status.is_active()).count()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_finished()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
