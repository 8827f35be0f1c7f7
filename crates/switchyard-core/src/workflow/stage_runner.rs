//! Executes one stage invocation with timeout, retry and routing.
//!
//! Each attempt of an inference stage asks the router for a node first, so a
//! retry may land somewhere else. The observed latency and outcome of every
//! inference attempt is fed back into the health monitor under the node that
//! was actually used. Tool stages go straight to the tool collaborator;
//! branch stages evaluate their expression and never call a backend.
//!
//! Retries apply only to transient failures and stop early if the run is
//! cancelled during a backoff wait.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use switchyard_types::config::StageConfig;
use switchyard_types::error::{CallError, StageError};
use switchyard_types::event::OrchestrationEvent;
use switchyard_types::workflow::{StageKind, StageSpec};

use super::expression::evaluate_condition;
use super::retry::RetryHandler;
use crate::backend::{BoxInferenceBackend, BoxToolBackend};
use crate::event::EventBus;
use crate::routing::InferenceRouter;

// ---------------------------------------------------------------------------
// Invocation and outcome types
// ---------------------------------------------------------------------------

/// Everything needed to run one stage once.
#[derive(Debug, Clone)]
pub struct StageInvocation {
    pub run_id: Uuid,
    pub stage: StageSpec,
    /// Resolved input payload.
    pub payload: Value,
    /// Run scope, read by branch expressions.
    pub scope: Value,
    /// Run-level cancellation. Interrupts backoff waits only.
    pub cancel: CancellationToken,
}

/// Progress reported while the invocation is running.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptUpdate {
    /// An attempt is about to call its backend.
    Started { attempt: u32, node_id: Option<String> },
    /// An attempt failed transiently; the next one follows after `backoff_ms`.
    Retrying {
        attempt: u32,
        error: String,
        backoff_ms: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageSuccess {
    pub output: Value,
    pub attempts: u32,
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageFailure {
    pub error: StageError,
    pub attempts: u32,
    pub node_id: Option<String>,
}

// ---------------------------------------------------------------------------
// StageRunner
// ---------------------------------------------------------------------------

pub struct StageRunner {
    router: InferenceRouter,
    inference: Arc<BoxInferenceBackend>,
    tools: Arc<BoxToolBackend>,
    events: EventBus,
    defaults: StageConfig,
    /// Cap on concurrent backend calls across all runs.
    global_limit: Option<Arc<Semaphore>>,
}

impl StageRunner {
    pub fn new(
        router: InferenceRouter,
        inference: Arc<BoxInferenceBackend>,
        tools: Arc<BoxToolBackend>,
        events: EventBus,
        defaults: StageConfig,
    ) -> Self {
        Self {
            router,
            inference,
            tools,
            events,
            defaults,
            global_limit: None,
        }
    }

    pub fn with_global_limit(mut self, limit: Option<Arc<Semaphore>>) -> Self {
        self.global_limit = limit;
        self
    }

    pub fn router(&self) -> &InferenceRouter {
        &self.router
    }

    /// Per-attempt timeout for a stage.
    pub fn timeout_for(&self, stage: &StageSpec) -> Duration {
        let ms = stage.timeout_ms.unwrap_or(match stage.kind {
            StageKind::Tool { .. } => self.defaults.tool_timeout_ms,
            StageKind::Inference { .. } | StageKind::Branch { .. } => {
                self.defaults.inference_timeout_ms
            }
        });
        Duration::from_millis(ms)
    }

    /// Run the invocation to a final result, retrying transient failures.
    ///
    /// Never makes more than `max_retries + 1` attempts.
    pub async fn run(
        &self,
        invocation: &StageInvocation,
        on_update: &(dyn Fn(AttemptUpdate) + Send + Sync),
    ) -> Result<StageSuccess, StageFailure> {
        let stage = &invocation.stage;
        let policy = stage
            .retry
            .clone()
            .unwrap_or_else(|| self.defaults.retry.clone());

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let (result, node_id) = self.attempt(invocation, attempt, on_update).await;

            let error = match result {
                Ok(output) => {
                    return Ok(StageSuccess {
                        output,
                        attempts: attempt,
                        node_id,
                    });
                }
                Err(error) => error,
            };

            if !RetryHandler::should_retry(&policy, attempt, &error) {
                tracing::warn!(
                    stage_id = %stage.id,
                    attempt,
                    error = %error,
                    "stage attempt failed, not retrying"
                );
                return Err(StageFailure {
                    error,
                    attempts: attempt,
                    node_id,
                });
            }

            let backoff = RetryHandler::backoff(&policy, attempt);
            tracing::warn!(
                stage_id = %stage.id,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "transient stage failure, retrying"
            );
            on_update(AttemptUpdate::Retrying {
                attempt,
                error: error.to_string(),
                backoff_ms: backoff.as_millis() as u64,
            });

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = invocation.cancel.cancelled() => {
                    tracing::debug!(stage_id = %stage.id, "run cancelled during backoff");
                    return Err(StageFailure {
                        error: StageError::Cancelled,
                        attempts: attempt,
                        node_id,
                    });
                }
            }
        }
    }

    async fn attempt(
        &self,
        invocation: &StageInvocation,
        attempt: u32,
        on_update: &(dyn Fn(AttemptUpdate) + Send + Sync),
    ) -> (Result<Value, StageError>, Option<String>) {
        let stage = &invocation.stage;
        match &stage.kind {
            StageKind::Branch { expression } => {
                on_update(AttemptUpdate::Started {
                    attempt,
                    node_id: None,
                });
                let result = evaluate_condition(expression, &invocation.scope)
                    .map(|met| json!({ "condition_met": met }))
                    .map_err(|e| StageError::InvalidInput(format!("branch expression: {e}")));
                (result, None)
            }
            StageKind::Tool { tool } => {
                on_update(AttemptUpdate::Started {
                    attempt,
                    node_id: None,
                });
                (self.call_tool(invocation, tool).await, None)
            }
            StageKind::Inference { capability, node } => {
                let (target, decision) =
                    match self.router.route(capability.as_deref(), node.as_deref()) {
                        Ok(routed) => routed,
                        Err(e) => return (Err(e), None),
                    };
                self.events.publish(OrchestrationEvent::NodeRouted {
                    run_id: invocation.run_id,
                    stage_id: stage.id.clone(),
                    node_id: decision.chosen_node.clone(),
                    reason: decision.reason,
                });
                on_update(AttemptUpdate::Started {
                    attempt,
                    node_id: Some(target.node_id.clone()),
                });
                let result = self.call_inference(invocation, &target).await;
                (result, Some(target.node_id))
            }
        }
    }

    async fn global_permit(&self) -> Result<Option<tokio::sync::OwnedSemaphorePermit>, StageError> {
        match &self.global_limit {
            Some(limit) => limit
                .clone()
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|_| StageError::Cancelled),
            None => Ok(None),
        }
    }

    async fn call_inference(
        &self,
        invocation: &StageInvocation,
        node: &switchyard_types::node::ModelNode,
    ) -> Result<Value, StageError> {
        let stage = &invocation.stage;
        let timeout = self.timeout_for(stage);
        let _permit = self.global_permit().await?;
        let health = self.router.health();
        let _in_flight = health.begin_call(&node.node_id);

        let call_cancel = CancellationToken::new();
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            timeout,
            self.inference
                .invoke(node, &invocation.payload, call_cancel.clone()),
        )
        .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (result, responded) = match outcome {
            Ok(Ok(output)) => (Ok(output), true),
            Ok(Err(CallError::InvalidInput(message))) => (Err(StageError::InvalidInput(message)), true),
            Ok(Err(CallError::Unavailable(message) | CallError::Execution(message))) => (
                Err(StageError::NodeUnavailable {
                    node_id: node.node_id.clone(),
                    message,
                }),
                false,
            ),
            Err(_) => {
                call_cancel.cancel();
                (
                    Err(StageError::StageTimeout {
                        stage_id: stage.id.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                    false,
                )
            }
        };

        if !self.router.registry().contains(&node.node_id) {
            tracing::debug!(node_id = %node.node_id, "node deregistered during call, sample dropped");
        } else if let Some(transition) = health.record(&node.node_id, latency_ms, responded) {
            self.events.publish(OrchestrationEvent::NodeHealthChanged {
                node_id: transition.node_id,
                healthy: transition.healthy,
            });
        }
        tracing::debug!(
            node_id = %node.node_id,
            latency_ms,
            success = result.is_ok(),
            "inference attempt finished"
        );
        result
    }

    async fn call_tool(&self, invocation: &StageInvocation, tool: &str) -> Result<Value, StageError> {
        let timeout = self.timeout_for(&invocation.stage);
        let _permit = self.global_permit().await?;

        match tokio::time::timeout(timeout, self.tools.call_tool(tool, &invocation.payload)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(CallError::InvalidInput(message))) => Err(StageError::InvalidInput(message)),
            Ok(Err(CallError::Execution(message))) => Err(StageError::ToolExecution {
                tool: tool.to_string(),
                message,
            }),
            Ok(Err(CallError::Unavailable(message))) => Err(StageError::NodeUnavailable {
                node_id: tool.to_string(),
                message,
            }),
            Err(_) => Err(StageError::StageTimeout {
                stage_id: invocation.stage.id.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

impl std::fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRunner")
            .field("defaults", &self.defaults)
            .field("global_limit", &self.global_limit.as_ref().map(|s| s.available_permits()))
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
