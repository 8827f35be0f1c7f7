//! The orchestration context: one explicitly constructed object that owns the
//! node registry, health monitor, router, event bus and run registry.
//!
//! Nothing in the crate is process-global. Tests and embedders build a fresh
//! [`Orchestrator`] per use with [`Orchestrator::builder`].

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Semaphore, broadcast};
use uuid::Uuid;

use switchyard_types::config::OrchestratorConfig;
use switchyard_types::error::{ConfigError, RunError};
use switchyard_types::event::OrchestrationEvent;
use switchyard_types::node::{ModelNode, NodeHealthSnapshot};
use switchyard_types::run::PipelineRun;
use switchyard_types::workflow::WorkflowDefinition;

use crate::backend::{BoxInferenceBackend, BoxToolBackend, InferenceBackend, ToolBackend};
use crate::clock::{SharedClock, SystemClock};
use crate::event::EventBus;
use crate::health::{HealthMonitor, TelemetrySink};
use crate::routing::{InferenceRouter, NodeRegistry};
use crate::run::RunRegistry;
use crate::workflow::scheduler::DagScheduler;
use crate::workflow::stage_runner::StageRunner;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct OrchestratorBuilder {
    inference: BoxInferenceBackend,
    tools: BoxToolBackend,
    config: OrchestratorConfig,
    clock: Option<SharedClock>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock for health windows, cool-downs and run retention.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Optional external sink for every health sample.
    pub fn telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    /// Validate the configuration and wire every component together.
    ///
    /// Nodes declared in the configuration are registered immediately.
    pub fn build(self) -> Result<Orchestrator, ConfigError> {
        self.config.validate()?;
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let mut health = HealthMonitor::new(config.health.clone(), clock.clone());
        if let Some(sink) = self.telemetry {
            health = health.with_telemetry(sink);
        }
        let health = Arc::new(health);

        let nodes = Arc::new(NodeRegistry::new());
        for node in &config.nodes {
            nodes.register(node.to_model_node());
        }

        let events = EventBus::new(config.events.channel_capacity);
        let router = InferenceRouter::new(nodes.clone(), health);
        let global_limit = config
            .scheduler
            .global_max_concurrent_stages
            .map(|n| Arc::new(Semaphore::new(n)));

        let runner = StageRunner::new(
            router.clone(),
            Arc::new(self.inference),
            Arc::new(self.tools),
            events.clone(),
            config.stage.clone(),
        )
        .with_global_limit(global_limit);

        let scheduler = DagScheduler::new(
            Arc::new(runner),
            events.clone(),
            clock.clone(),
            config.scheduler.max_parallelism,
        );
        let retention = chrono::Duration::seconds(
            i64::try_from(config.scheduler.run_retention_secs).unwrap_or(i64::MAX / 1_000),
        );
        let runs = RunRegistry::new(scheduler, clock, retention);

        tracing::info!(
            nodes = nodes.len(),
            max_parallelism = config.scheduler.max_parallelism,
            "orchestrator ready"
        );

        Ok(Orchestrator {
            config,
            nodes,
            router,
            events,
            runs,
        })
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    config: OrchestratorConfig,
    nodes: Arc<NodeRegistry>,
    router: InferenceRouter,
    events: EventBus,
    runs: RunRegistry,
}

impl Orchestrator {
    pub fn builder<I, T>(inference: I, tools: T) -> OrchestratorBuilder
    where
        I: InferenceBackend + 'static,
        T: ToolBackend + 'static,
    {
        OrchestratorBuilder {
            inference: BoxInferenceBackend::new(inference),
            tools: BoxToolBackend::new(tools),
            config: OrchestratorConfig::default(),
            clock: None,
            telemetry: None,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // -- nodes --------------------------------------------------------------

    /// Add or replace a node. Returns `true` if a node with the same ID was
    /// replaced.
    pub fn register_node(&self, node: ModelNode) -> bool {
        tracing::info!(node_id = %node.node_id, "registering node");
        self.nodes.register(node)
    }

    /// Remove a node and forget its health history. Calls already routed to
    /// it finish normally.
    pub fn deregister_node(&self, node_id: &str) -> Option<ModelNode> {
        let removed = self.nodes.deregister(node_id);
        if removed.is_some() {
            tracing::info!(node_id, "deregistered node");
            self.router.health().remove(node_id);
        }
        removed
    }

    pub fn nodes(&self) -> Vec<ModelNode> {
        self.nodes.list()
    }

    pub fn node_health(&self) -> Vec<NodeHealthSnapshot> {
        self.router.node_health()
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        self.router.health()
    }

    // -- runs ---------------------------------------------------------------

    /// Validate and start a run. Must be called inside a Tokio runtime.
    pub fn start_run(&self, definition: &WorkflowDefinition, input: Value) -> Result<Uuid, RunError> {
        self.runs.start_run(definition, input)
    }

    pub fn get_run_status(&self, run_id: Uuid) -> Result<PipelineRun, RunError> {
        self.runs.get_run_status(run_id)
    }

    pub fn cancel_run(&self, run_id: Uuid) -> Result<(), RunError> {
        self.runs.cancel_run(run_id)
    }

    pub async fn wait_for_completion(&self, run_id: Uuid) -> Result<PipelineRun, RunError> {
        self.runs.wait_for_completion(run_id).await
    }

    pub fn list_runs(&self) -> Vec<PipelineRun> {
        self.runs.list_runs()
    }

    pub fn cleanup_run(&self, run_id: Uuid) -> Result<PipelineRun, RunError> {
        self.runs.cleanup(run_id)
    }

    pub fn evict_expired_runs(&self) -> usize {
        self.runs.evict_expired()
    }

    // -- events -------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("nodes", &self.nodes.len())
            .field("runs", &self.runs)
            .finish_non_exhaustive()
    }
}
