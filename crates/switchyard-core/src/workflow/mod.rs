//! Workflow definitions, graph compilation and execution.

pub mod definition;
pub mod expression;
pub mod graph;
pub mod retry;
pub mod scheduler;
pub mod stage_runner;
pub mod template;

pub use definition::{
    load_workflow_file, parse_workflow_json, parse_workflow_yaml, serialize_workflow_yaml,
    validate_definition,
};
pub use expression::{ExpressionError, StageEvaluator, evaluate_condition};
pub use graph::WorkflowGraph;
pub use retry::RetryHandler;
pub use scheduler::DagScheduler;
pub use stage_runner::{AttemptUpdate, StageFailure, StageInvocation, StageRunner, StageSuccess};
