//! Event types for the Switchyard event bus.
//!
//! `OrchestrationEvent` is the unified event type broadcast on run and stage
//! transitions. All variants are Clone + Send + Sync for use with tokio
//! broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node::RoutingReason;
use crate::run::RunOutcome;

/// Events emitted while workflows execute.
///
/// Consumers (UI, telemetry) subscribe to the bus; the core never knows who
/// is listening.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    /// A pipeline run has been created and scheduling began.
    RunStarted {
        run_id: Uuid,
        workflow_name: String,
        stage_count: usize,
    },

    /// All dependencies of a stage resolved and it entered the ready queue.
    StageReady { run_id: Uuid, stage_id: String },

    /// A stage was dispatched to the stage runner.
    StageStarted {
        run_id: Uuid,
        stage_id: String,
        kind: String,
    },

    /// A stage attempt failed transiently and will be retried.
    StageRetrying {
        run_id: Uuid,
        stage_id: String,
        attempt: u32,
        error: String,
        backoff_ms: u64,
    },

    /// A stage completed successfully.
    StageSucceeded {
        run_id: Uuid,
        stage_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
        attempts: u32,
        duration_ms: u64,
    },

    /// A stage failed terminally.
    StageFailed {
        run_id: Uuid,
        stage_id: String,
        error: String,
        attempts: u32,
    },

    /// A stage will not run (unmet condition, upstream failure, cancellation).
    StageSkipped {
        run_id: Uuid,
        stage_id: String,
        reason: String,
    },

    /// A stage was cancelled while waiting to retry.
    StageCancelled { run_id: Uuid, stage_id: String },

    /// Cancellation of a run was requested.
    RunCancelRequested { run_id: Uuid },

    /// A run reached its terminal outcome.
    RunCompleted {
        run_id: Uuid,
        workflow_name: String,
        outcome: RunOutcome,
        duration_ms: u64,
    },

    /// The router picked a node for an inference attempt.
    NodeRouted {
        run_id: Uuid,
        stage_id: String,
        node_id: String,
        reason: RoutingReason,
    },

    /// A node's health flag flipped.
    NodeHealthChanged { node_id: String, healthy: bool },
}

impl OrchestrationEvent {
    /// Dotted event name (e.g. `stage.started`) for pub/sub topic routing.
    pub fn name(&self) -> &'static str {
        match self {
            OrchestrationEvent::RunStarted { .. } => "run.started",
            OrchestrationEvent::StageReady { .. } => "stage.ready",
            OrchestrationEvent::StageStarted { .. } => "stage.started",
            OrchestrationEvent::StageRetrying { .. } => "stage.retrying",
            OrchestrationEvent::StageSucceeded { .. } => "stage.succeeded",
            OrchestrationEvent::StageFailed { .. } => "stage.failed",
            OrchestrationEvent::StageSkipped { .. } => "stage.skipped",
            OrchestrationEvent::StageCancelled { .. } => "stage.cancelled",
            OrchestrationEvent::RunCancelRequested { .. } => "run.cancel_requested",
            OrchestrationEvent::RunCompleted { .. } => "run.completed",
            OrchestrationEvent::NodeRouted { .. } => "node.routed",
            OrchestrationEvent::NodeHealthChanged { .. } => "node.health_changed",
        }
    }

    /// Returns the run_id for run-scoped variants, or None for node-scoped
    /// events.
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            OrchestrationEvent::RunStarted { run_id, .. }
            | OrchestrationEvent::StageReady { run_id, .. }
            | OrchestrationEvent::StageStarted { run_id, .. }
            | OrchestrationEvent::StageRetrying { run_id, .. }
            | OrchestrationEvent::StageSucceeded { run_id, .. }
            | OrchestrationEvent::StageFailed { run_id, .. }
            | OrchestrationEvent::StageSkipped { run_id, .. }
            | OrchestrationEvent::StageCancelled { run_id, .. }
            | OrchestrationEvent::RunCancelRequested { run_id }
            | OrchestrationEvent::RunCompleted { run_id, .. }
            | OrchestrationEvent::NodeRouted { run_id, .. } => Some(*run_id),

            OrchestrationEvent::NodeHealthChanged { .. } => None,
        }
    }

    /// Returns the stage_id for stage-scoped variants.
    pub fn stage_id(&self) -> Option<&str> {
        match self {
            OrchestrationEvent::StageReady { stage_id, .. }
            | OrchestrationEvent::StageStarted { stage_id, .. }
            | OrchestrationEvent::StageRetrying { stage_id, .. }
            | OrchestrationEvent::StageSucceeded { stage_id, .. }
            | OrchestrationEvent::StageFailed { stage_id, .. }
            | OrchestrationEvent::StageSkipped { stage_id, .. }
            | OrchestrationEvent::StageCancelled { stage_id, .. }
            | OrchestrationEvent::NodeRouted { stage_id, .. } => Some(stage_id),

            OrchestrationEvent::RunStarted { .. }
            | OrchestrationEvent::RunCancelRequested { .. }
            | OrchestrationEvent::RunCompleted { .. }
            | OrchestrationEvent::NodeHealthChanged { .. } => None,
        }
    }
}
