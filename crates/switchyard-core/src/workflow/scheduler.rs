//! DAG scheduler: runs a compiled workflow graph to completion.
//!
//! The scheduler owns the run's `PipelineRun` state exclusively. Readers get
//! snapshots through a `watch` channel that is replaced after every change.
//!
//! Execution model:
//! 1. Stages with no dependencies are resolved up front.
//! 2. A stage is resolved once every dependency is terminal: it becomes
//!    READY, or SKIPPED (upstream failure, or a false condition), or FAILED
//!    (condition could not be evaluated).
//! 3. READY stages are dispatched in definition order while a permit of the
//!    per-run semaphore (size `P`) is free. Each dispatch is a task in a
//!    `JoinSet` that drives the `StageRunner`.
//! 4. Completions settle dependents and refill the ready queue.
//!
//! Cancellation only stops new dispatches. The token is checked before every
//! dispatch round, so nothing starts once a cancel has been acknowledged.
//! Running stages finish, except that a stage waiting out a retry backoff
//! ends CANCELLED.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use switchyard_types::error::StageError;
use switchyard_types::event::OrchestrationEvent;
use switchyard_types::run::{PipelineRun, RunOutcome, StageRecord, StageStatus};

use super::expression::evaluate_condition;
use super::graph::WorkflowGraph;
use super::stage_runner::{AttemptUpdate, StageFailure, StageInvocation, StageRunner, StageSuccess};
use super::template::{build_scope, default_payload, resolve_template};
use crate::clock::SharedClock;
use crate::event::EventBus;

type StageResult = Result<StageSuccess, StageFailure>;

// ---------------------------------------------------------------------------
// DagScheduler
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct DagScheduler {
    runner: Arc<StageRunner>,
    events: EventBus,
    clock: SharedClock,
    /// Used when the workflow does not set its own `max_parallelism`.
    default_parallelism: usize,
}

impl DagScheduler {
    pub fn new(
        runner: Arc<StageRunner>,
        events: EventBus,
        clock: SharedClock,
        default_parallelism: usize,
    ) -> Self {
        Self {
            runner,
            events,
            clock,
            default_parallelism: default_parallelism.max(1),
        }
    }

    /// Effective per-run concurrency for a graph.
    pub fn parallelism_for(&self, graph: &WorkflowGraph) -> usize {
        graph
            .max_parallelism()
            .unwrap_or(self.default_parallelism)
            .max(1)
    }

    /// The snapshot of a run that has not started any stage yet.
    pub fn initial_run(&self, graph: &WorkflowGraph, run_id: Uuid) -> PipelineRun {
        PipelineRun {
            run_id,
            workflow_name: graph.name().to_string(),
            stages: graph
                .stages()
                .iter()
                .map(|s| StageRecord::pending(s.id.clone()))
                .collect(),
            started_at: self.clock.now(),
            finished_at: None,
            outcome: RunOutcome::Running,
            cancel_requested: false,
        }
    }

    /// Execute every stage of `graph`, publishing snapshots on `snapshots`.
    ///
    /// Returns the final snapshot. Never fails: stage failures are recorded
    /// on the run.
    pub async fn execute(
        &self,
        graph: &WorkflowGraph,
        run_id: Uuid,
        input: Value,
        cancel: CancellationToken,
        snapshots: watch::Sender<PipelineRun>,
    ) -> PipelineRun {
        let parallelism = self.parallelism_for(graph);
        let started = Instant::now();
        let mut state = RunState {
            graph,
            run: self.initial_run(graph, run_id),
            blocking: vec![false; graph.stage_count()],
            ready: BTreeSet::new(),
            dispatched_at: vec![None; graph.stage_count()],
            input,
            events: &self.events,
            clock: &self.clock,
            snapshots,
        };

        tracing::info!(
            run_id = %run_id,
            workflow = graph.name(),
            stages = graph.stage_count(),
            parallelism,
            "run started"
        );
        self.events.publish(OrchestrationEvent::RunStarted {
            run_id,
            workflow_name: graph.name().to_string(),
            stage_count: graph.stage_count(),
        });

        for index in 0..graph.stage_count() {
            if graph.dependency_indices(index).is_empty() && state.resolve(index) {
                state.settle_dependents(index);
            }
        }
        state.publish();

        let permits = Arc::new(Semaphore::new(parallelism));
        let (update_tx, mut update_rx) = mpsc::unbounded_channel::<(usize, AttemptUpdate)>();
        let mut tasks: JoinSet<(usize, StageResult)> = JoinSet::new();
        let mut task_stage: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut cancel_seen = false;

        loop {
            if !cancel_seen && cancel.is_cancelled() && state.has_unfinished() {
                cancel_seen = true;
                state.note_cancel(tasks.len());
            }
            if !cancel_seen {
                while let Some(&index) = state.ready.first() {
                    let Ok(permit) = permits.clone().try_acquire_owned() else {
                        break;
                    };
                    state.ready.remove(&index);
                    let invocation = state.dispatch(index, &cancel);
                    let runner = Arc::clone(&self.runner);
                    let tx = update_tx.clone();
                    let span = tracing::info_span!(
                        "stage",
                        run_id = %run_id,
                        stage_id = %invocation.stage.id,
                        kind = invocation.stage.kind.label()
                    );
                    let handle = tasks.spawn(
                        async move {
                            let _permit = permit;
                            let on_update = move |update: AttemptUpdate| {
                                let _ = tx.send((index, update));
                            };
                            let result = runner.run(&invocation, &on_update).await;
                            (index, result)
                        }
                        .instrument(span),
                    );
                    task_stage.insert(handle.id(), index);
                }
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                Some((index, update)) = update_rx.recv() => {
                    state.apply_update(index, update);
                }
                joined = tasks.join_next_with_id() => {
                    // Progress sent before the task returned is applied first.
                    while let Ok((index, update)) = update_rx.try_recv() {
                        state.apply_update(index, update);
                    }
                    match joined {
                        Some(Ok((id, (index, result)))) => {
                            task_stage.remove(&id);
                            state.complete(index, result);
                        }
                        Some(Err(join_error)) => {
                            let Some(index) = task_stage.remove(&join_error.id()) else {
                                continue;
                            };
                            tracing::error!(
                                run_id = %run_id,
                                stage_id = %graph.stages()[index].id,
                                error = %join_error,
                                "stage task aborted"
                            );
                            let attempts = state.run.stages[index].attempts;
                            let node_id = state.run.stages[index].node_id.clone();
                            state.complete(
                                index,
                                Err(StageFailure {
                                    error: StageError::InvalidInput(format!("stage task aborted: {join_error}")),
                                    attempts,
                                    node_id,
                                }),
                            );
                        }
                        None => {}
                    }
                }
                _ = cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    state.note_cancel(tasks.len());
                }
            }
        }

        // Cancellation seen before the last completion still counts.
        if cancel.is_cancelled() && !cancel_seen && state.has_unfinished() {
            cancel_seen = true;
            state.note_cancel(0);
        }
        if cancel_seen {
            state.skip_unstarted("run cancelled");
        }

        let outcome = state.outcome(cancel_seen);
        state.run.outcome = outcome;
        state.run.finished_at = Some(self.clock.now());
        state.publish();

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(run_id = %run_id, outcome = %outcome, duration_ms, "run finished");
        self.events.publish(OrchestrationEvent::RunCompleted {
            run_id,
            workflow_name: graph.name().to_string(),
            outcome,
            duration_ms,
        });
        state.run
    }
}

impl std::fmt::Debug for DagScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagScheduler")
            .field("default_parallelism", &self.default_parallelism)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Per-run state
// ---------------------------------------------------------------------------

struct RunState<'a> {
    graph: &'a WorkflowGraph,
    run: PipelineRun,
    /// Terminal stages whose result keeps dependents from running.
    blocking: Vec<bool>,
    ready: BTreeSet<usize>,
    dispatched_at: Vec<Option<Instant>>,
    input: Value,
    events: &'a EventBus,
    clock: &'a SharedClock,
    snapshots: watch::Sender<PipelineRun>,
}

impl RunState<'_> {
    fn run_id(&self) -> Uuid {
        self.run.run_id
    }

    fn stage_id(&self, index: usize) -> String {
        self.graph.stages()[index].id.clone()
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.run.clone());
    }

    /// Apply a status change if the transition is legal.
    fn transition(&mut self, index: usize, next: StageStatus) -> bool {
        let now = self.clock.now();
        let record = &mut self.run.stages[index];
        if !record.status.can_transition_to(next) {
            tracing::debug!(
                stage_id = %record.stage_id,
                from = %record.status,
                to = %next,
                "ignoring illegal stage transition"
            );
            return false;
        }
        record.status = next;
        if next == StageStatus::Running && record.started_at.is_none() {
            record.started_at = Some(now);
        }
        if next.is_terminal() {
            record.finished_at = Some(now);
        }
        true
    }

    fn scope(&self) -> Value {
        build_scope(&self.input, &self.run.stages)
    }

    /// Decide what happens to a stage whose dependencies are all terminal.
    ///
    /// Returns `true` if the stage itself became terminal.
    fn resolve(&mut self, index: usize) -> bool {
        let graph = self.graph;
        let stage = &graph.stages()[index];
        let blocked = graph
            .dependency_indices(index)
            .iter()
            .any(|&d| self.blocking[d]);

        if blocked && !stage.continue_on_failure {
            self.skip(index, "upstream stage failed", true);
            return true;
        }

        if let Some(condition) = &stage.condition {
            match evaluate_condition(condition, &self.scope()) {
                Ok(true) => {}
                Ok(false) => {
                    self.skip(index, "condition not met", false);
                    return true;
                }
                Err(e) => {
                    let message = format!("condition evaluation failed: {e}");
                    tracing::warn!(stage_id = %stage.id, error = %message, "stage condition error");
                    if self.transition(index, StageStatus::Failed) {
                        self.run.stages[index].error = Some(message.clone());
                        self.blocking[index] = true;
                        self.events.publish(OrchestrationEvent::StageFailed {
                            run_id: self.run_id(),
                            stage_id: self.stage_id(index),
                            error: message,
                            attempts: 0,
                        });
                    }
                    return true;
                }
            }
        }

        if self.transition(index, StageStatus::Ready) {
            self.ready.insert(index);
            self.events.publish(OrchestrationEvent::StageReady {
                run_id: self.run_id(),
                stage_id: self.stage_id(index),
            });
        }
        false
    }

    fn skip(&mut self, index: usize, reason: &str, blocking: bool) {
        if !self.transition(index, StageStatus::Skipped) {
            return;
        }
        self.ready.remove(&index);
        self.blocking[index] = blocking;
        tracing::debug!(stage_id = %self.graph.stages()[index].id, reason, "stage skipped");
        self.events.publish(OrchestrationEvent::StageSkipped {
            run_id: self.run_id(),
            stage_id: self.stage_id(index),
            reason: reason.to_string(),
        });
    }

    /// Resolve every pending dependent whose dependencies are now terminal,
    /// following chains of stages that become terminal without running.
    fn settle_dependents(&mut self, index: usize) {
        let mut queue = VecDeque::from([index]);
        while let Some(done) = queue.pop_front() {
            for &dependent in self.graph.dependent_indices(done) {
                if self.run.stages[dependent].status != StageStatus::Pending {
                    continue;
                }
                let all_terminal = self
                    .graph
                    .dependency_indices(dependent)
                    .iter()
                    .all(|&d| self.run.stages[d].status.is_terminal());
                if all_terminal && self.resolve(dependent) {
                    queue.push_back(dependent);
                }
            }
        }
    }

    /// Move a READY stage to RUNNING and build its invocation.
    fn dispatch(&mut self, index: usize, cancel: &CancellationToken) -> StageInvocation {
        let stage = self.graph.stages()[index].clone();
        self.transition(index, StageStatus::Running);
        self.dispatched_at[index] = Some(Instant::now());

        let scope = self.scope();
        let payload = match &stage.input_template {
            Some(template) => resolve_template(template, &scope),
            None => {
                let deps: Vec<(&str, Option<&Value>)> = self
                    .graph
                    .dependency_indices(index)
                    .iter()
                    .map(|&d| {
                        let record = &self.run.stages[d];
                        (record.stage_id.as_str(), record.output.as_ref())
                    })
                    .collect();
                default_payload(&self.input, &deps)
            }
        };

        tracing::debug!(run_id = %self.run_id(), stage_id = %stage.id, "dispatching stage");
        self.events.publish(OrchestrationEvent::StageStarted {
            run_id: self.run_id(),
            stage_id: stage.id.clone(),
            kind: stage.kind.label().to_string(),
        });
        self.publish();

        StageInvocation {
            run_id: self.run_id(),
            stage,
            payload,
            scope,
            cancel: cancel.clone(),
        }
    }

    fn apply_update(&mut self, index: usize, update: AttemptUpdate) {
        match update {
            AttemptUpdate::Started { attempt, node_id } => {
                if self.run.stages[index].status == StageStatus::Retrying {
                    self.transition(index, StageStatus::Running);
                }
                let record = &mut self.run.stages[index];
                if record.status.is_terminal() {
                    return;
                }
                record.attempts = attempt;
                if node_id.is_some() {
                    record.node_id = node_id;
                }
            }
            AttemptUpdate::Retrying {
                attempt,
                error,
                backoff_ms,
            } => {
                if !self.transition(index, StageStatus::Retrying) {
                    return;
                }
                self.run.stages[index].error = Some(error.clone());
                self.events.publish(OrchestrationEvent::StageRetrying {
                    run_id: self.run_id(),
                    stage_id: self.stage_id(index),
                    attempt,
                    error,
                    backoff_ms,
                });
            }
        }
        self.publish();
    }

    fn complete(&mut self, index: usize, result: StageResult) {
        let duration_ms = self.dispatched_at[index]
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or_default();

        match result {
            Ok(success) => {
                if self.transition(index, StageStatus::Succeeded) {
                    let record = &mut self.run.stages[index];
                    record.output = Some(success.output);
                    record.attempts = success.attempts;
                    record.node_id = success.node_id.clone();
                    record.error = None;
                    tracing::debug!(stage_id = %record.stage_id, duration_ms, "stage succeeded");
                    self.events.publish(OrchestrationEvent::StageSucceeded {
                        run_id: self.run_id(),
                        stage_id: self.stage_id(index),
                        node_id: success.node_id,
                        attempts: success.attempts,
                        duration_ms,
                    });
                }
            }
            Err(failure) if failure.error == StageError::Cancelled => {
                if self.transition(index, StageStatus::Cancelled) {
                    self.blocking[index] = true;
                    let record = &mut self.run.stages[index];
                    record.attempts = failure.attempts;
                    record.error = Some(failure.error.to_string());
                    self.events.publish(OrchestrationEvent::StageCancelled {
                        run_id: self.run_id(),
                        stage_id: self.stage_id(index),
                    });
                }
            }
            Err(failure) => {
                if self.transition(index, StageStatus::Failed) {
                    self.blocking[index] = true;
                    let message = failure.error.to_string();
                    let record = &mut self.run.stages[index];
                    record.attempts = failure.attempts;
                    record.error = Some(message.clone());
                    if failure.node_id.is_some() {
                        record.node_id = failure.node_id;
                    }
                    tracing::warn!(
                        stage_id = %record.stage_id,
                        attempts = failure.attempts,
                        error = %message,
                        "stage failed"
                    );
                    self.events.publish(OrchestrationEvent::StageFailed {
                        run_id: self.run_id(),
                        stage_id: self.stage_id(index),
                        error: message,
                        attempts: failure.attempts,
                    });
                }
            }
        }

        self.settle_dependents(index);
        self.publish();
    }

    fn has_unfinished(&self) -> bool {
        self.run.stages.iter().any(|s| !s.status.is_terminal())
    }

    /// Record an observed cancel request. Called once per run.
    fn note_cancel(&mut self, running: usize) {
        let run_id = self.run_id();
        tracing::info!(run_id = %run_id, running, "cancellation requested");
        self.run.cancel_requested = true;
        self.events.publish(OrchestrationEvent::RunCancelRequested { run_id });
        self.publish();
    }

    /// Skip every stage that never got to run.
    fn skip_unstarted(&mut self, reason: &str) {
        for index in 0..self.run.stages.len() {
            if matches!(
                self.run.stages[index].status,
                StageStatus::Pending | StageStatus::Ready
            ) {
                self.skip(index, reason, true);
            }
        }
    }

    fn outcome(&self, cancelled: bool) -> RunOutcome {
        if cancelled {
            return RunOutcome::Cancelled;
        }
        let required_failed = self
            .run
            .stages
            .iter()
            .zip(self.graph.stages())
            .any(|(record, spec)| {
                !spec.optional
                    && matches!(record.status, StageStatus::Failed | StageStatus::Cancelled)
            });
        if required_failed {
            RunOutcome::Failed
        } else {
            RunOutcome::Succeeded
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use switchyard_types::config::{HealthConfig, StageConfig};
    use switchyard_types::error::CallError;
    use switchyard_types::workflow::{RetryPolicy, StageKind, StageSpec, WorkflowDefinition};

    use crate::backend::scripted::Script;
    use crate::backend::{BoxInferenceBackend, BoxToolBackend};
    use crate::clock::ManualClock;
    use crate::health::HealthMonitor;
    use crate::routing::{InferenceRouter, NodeRegistry};

    struct Harness {
        scheduler: DagScheduler,
        script: Script,
        events: EventBus,
    }

    fn harness(parallelism: usize) -> Harness {
        let script = Script::new();
        let tools = BoxToolBackend::new(script.clone());
        harness_with_tools(parallelism, script, tools)
    }

    fn harness_with_tools(parallelism: usize, script: Script, tools: BoxToolBackend) -> Harness {
        let clock: SharedClock = Arc::new(ManualClock::default());
        let registry = Arc::new(NodeRegistry::new());
        let health = Arc::new(HealthMonitor::new(HealthConfig::default(), clock.clone()));
        let events = EventBus::new(256);
        let defaults = StageConfig {
            retry: RetryPolicy::none(),
            ..StageConfig::default()
        };
        let runner = StageRunner::new(
            InferenceRouter::new(registry, health),
            Arc::new(BoxInferenceBackend::new(script.clone())),
            Arc::new(tools),
            events.clone(),
            defaults,
        );
        Harness {
            scheduler: DagScheduler::new(Arc::new(runner), events.clone(), clock, parallelism),
            script,
            events,
        }
    }

    fn tool(id: &str) -> StageSpec {
        StageSpec::new(id, StageKind::Tool { tool: id.to_string() })
    }

    fn graph(stages: Vec<StageSpec>) -> WorkflowGraph {
        WorkflowGraph::compile(&WorkflowDefinition {
            name: "test".to_string(),
            description: None,
            max_parallelism: None,
            stages,
        })
        .unwrap()
    }

    async fn run(h: &Harness, graph: &WorkflowGraph, input: Value) -> PipelineRun {
        let (tx, _rx) = watch::channel(h.scheduler.initial_run(graph, Uuid::nil()));
        h.scheduler
            .execute(graph, Uuid::now_v7(), input, CancellationToken::new(), tx)
            .await
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<OrchestrationEvent>) -> Vec<OrchestrationEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn linear_chain_runs_in_order() {
        let h = harness(4);
        let mut events = h.events.subscribe();
        let g = graph(vec![tool("a"), tool("b").after(["a"]), tool("c").after(["b"])]);

        let run = run(&h, &g, json!({})).await;
        assert_eq!(run.outcome, RunOutcome::Succeeded);
        assert_eq!(
            run.statuses(),
            vec![StageStatus::Succeeded, StageStatus::Succeeded, StageStatus::Succeeded]
        );
        assert_eq!(h.script.calls(), vec!["a", "b", "c"]);

        // b starts only after a has succeeded
        let names: Vec<(String, Option<String>)> = drain(&mut events)
            .iter()
            .map(|e| (e.name().to_string(), e.stage_id().map(str::to_string)))
            .collect();
        let a_done = names
            .iter()
            .position(|n| n == &("stage.succeeded".to_string(), Some("a".to_string())))
            .unwrap();
        let b_start = names
            .iter()
            .position(|n| n == &("stage.started".to_string(), Some("b".to_string())))
            .unwrap();
        assert!(a_done < b_start);
        assert_eq!(names.last().unwrap().0, "run.completed");
    }

    #[tokio::test(start_paused = true)]
    async fn diamond_failure_skips_join() {
        let h = harness(4);
        h.script.fail_times("b", 1, CallError::Execution("exit 1".into()));
        let g = graph(vec![
            tool("a"),
            tool("b").after(["a"]),
            tool("c").after(["a"]),
            tool("d").after(["b", "c"]),
        ]);

        let run = run(&h, &g, json!({})).await;
        assert_eq!(run.outcome, RunOutcome::Failed);
        assert_eq!(run.status_of("b"), Some(StageStatus::Failed));
        assert_eq!(run.status_of("c"), Some(StageStatus::Succeeded));
        assert_eq!(run.status_of("d"), Some(StageStatus::Skipped));
        assert!(run.stage("b").unwrap().error.as_deref().unwrap().contains("exit 1"));
        assert_eq!(h.script.call_count("d"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_skips_transitive_dependents() {
        let h = harness(4);
        h.script.fail_times("a", 1, CallError::Execution("boom".into()));
        let g = graph(vec![tool("a"), tool("b").after(["a"]), tool("c").after(["b"])]);
        let run = run(&h, &g, json!({})).await;
        assert_eq!(
            run.statuses(),
            vec![StageStatus::Failed, StageStatus::Skipped, StageStatus::Skipped]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn continue_on_failure_still_runs() {
        let h = harness(4);
        h.script.fail_times("b", 1, CallError::Execution("exit 1".into()));
        let mut d = tool("d").after(["b", "c"]);
        d.continue_on_failure = true;
        let g = graph(vec![tool("a"), tool("b").after(["a"]), tool("c").after(["a"]), d]);

        let run = run(&h, &g, json!({})).await;
        assert_eq!(run.status_of("d"), Some(StageStatus::Succeeded));
        assert_eq!(run.outcome, RunOutcome::Failed);
        let payload = &run.stage("d").unwrap().output.as_ref().unwrap()["payload"];
        assert_eq!(payload["dependencies"]["b"], Value::Null);
        assert_eq!(payload["dependencies"]["c"]["key"], "c");
    }

    #[tokio::test(start_paused = true)]
    async fn optional_failure_does_not_fail_run() {
        let h = harness(4);
        h.script.fail_times("lint", 1, CallError::Execution("warnings".into()));
        let mut lint = tool("lint");
        lint.optional = true;
        let g = graph(vec![tool("build"), lint]);
        let run = run(&h, &g, json!({})).await;
        assert_eq!(run.status_of("lint"), Some(StageStatus::Failed));
        assert_eq!(run.outcome, RunOutcome::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn false_condition_skips_without_blocking() {
        let h = harness(4);
        let mut notify = tool("notify");
        notify.condition = Some("input.notify == true".to_string());
        let g = graph(vec![notify, tool("archive").after(["notify"])]);

        let run = run(&h, &g, json!({ "notify": false })).await;
        assert_eq!(run.status_of("notify"), Some(StageStatus::Skipped));
        assert_eq!(run.status_of("archive"), Some(StageStatus::Succeeded));
        assert_eq!(run.outcome, RunOutcome::Succeeded);
        assert_eq!(h.script.calls(), vec!["archive"]);
    }

    #[tokio::test(start_paused = true)]
    async fn condition_reads_upstream_output() {
        let h = harness(4);
        let gate = StageSpec::new(
            "gate",
            StageKind::Branch {
                expression: "input.score > 5".into(),
            },
        );
        let mut publish = tool("publish").after(["gate"]);
        publish.condition = Some("stages.gate.output.condition_met".into());
        let mut discard = tool("discard").after(["gate"]);
        discard.condition = Some("(stages.gate.output.condition_met)|not".into());
        let g = graph(vec![gate, publish, discard]);

        let run = run(&h, &g, json!({ "score": 9 })).await;
        assert_eq!(run.status_of("publish"), Some(StageStatus::Succeeded));
        assert_eq!(run.status_of("discard"), Some(StageStatus::Skipped));
    }

    #[tokio::test(start_paused = true)]
    async fn condition_error_fails_stage() {
        let h = harness(4);
        let mut bad = tool("bad");
        bad.condition = Some("input.x ==".into());
        let g = graph(vec![bad, tool("after").after(["bad"])]);
        let run = run(&h, &g, json!({})).await;
        assert_eq!(run.status_of("bad"), Some(StageStatus::Failed));
        assert_eq!(run.status_of("after"), Some(StageStatus::Skipped));
        assert_eq!(run.outcome, RunOutcome::Failed);
        assert!(h.script.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn template_resolves_upstream_outputs() {
        let h = harness(4);
        let mut summarize = tool("summarize").after(["fetch"]);
        summarize.input_template = Some(json!({
            "source": "{{ stages.fetch.output.key }}",
            "topic": "about {{ input.topic }}"
        }));
        let g = graph(vec![tool("fetch"), summarize]);

        let run = run(&h, &g, json!({ "topic": "rust" })).await;
        let payload = &run.stage("summarize").unwrap().output.as_ref().unwrap()["payload"];
        assert_eq!(payload["source"], "fetch");
        assert_eq!(payload["topic"], "about rust");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_never_exceeds_parallelism() {
        for p in 1..=3usize {
            let h = harness(p);
            h.script.default_delay(100);
            let stages: Vec<StageSpec> = (0..6).map(|i| tool(&format!("s{i}"))).collect();
            let g = graph(stages);

            let (tx, mut rx) = watch::channel(h.scheduler.initial_run(&g, Uuid::nil()));
            let watcher = tokio::spawn(async move {
                let mut peak = 0;
                while rx.changed().await.is_ok() {
                    peak = peak.max(rx.borrow_and_update().active_count());
                }
                peak
            });
            let run = h
                .scheduler
                .execute(&g, Uuid::now_v7(), json!({}), CancellationToken::new(), tx)
                .await;

            assert_eq!(run.outcome, RunOutcome::Succeeded);
            assert_eq!(h.script.peak_concurrency(), p);
            assert!(watcher.await.unwrap() <= p);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn workflow_parallelism_overrides_default() {
        let h = harness(8);
        h.script.default_delay(50);
        let mut def = WorkflowDefinition {
            name: "narrow".into(),
            description: None,
            max_parallelism: Some(1),
            stages: (0..4).map(|i| tool(&format!("s{i}"))).collect(),
        };
        def.stages.push(tool("tail").after(["s0"]));
        let g = WorkflowGraph::compile(&def).unwrap();
        let run = run(&h, &g, json!({})).await;
        assert_eq!(run.outcome, RunOutcome::Succeeded);
        assert_eq!(h.script.peak_concurrency(), 1);
        // ready order follows definition order
        assert_eq!(h.script.calls(), vec!["s0", "s1", "s2", "s3", "tail"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_lets_running_stage_finish() {
        let h = harness(4);
        h.script.delay("a", 1_000);
        let g = graph(vec![tool("a"), tool("b").after(["a"])]);
        let cancel = CancellationToken::new();
        let (tx, _rx) = watch::channel(h.scheduler.initial_run(&g, Uuid::nil()));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let run = h
            .scheduler
            .execute(&g, Uuid::now_v7(), json!({}), cancel, tx)
            .await;

        assert_eq!(run.outcome, RunOutcome::Cancelled);
        assert!(run.cancel_requested);
        assert_eq!(run.status_of("a"), Some(StageStatus::Succeeded));
        assert_eq!(run.status_of("b"), Some(StageStatus::Skipped));
        assert_eq!(h.script.call_count("b"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_start_dispatches_nothing() {
        let h = harness(4);
        let mut rx = h.events.subscribe();
        let g = graph(vec![tool("a"), tool("b")]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = watch::channel(h.scheduler.initial_run(&g, Uuid::nil()));

        let run = h
            .scheduler
            .execute(&g, Uuid::now_v7(), json!({}), cancel, tx)
            .await;

        assert_eq!(run.outcome, RunOutcome::Cancelled);
        assert!(run.cancel_requested);
        assert_eq!(run.status_of("a"), Some(StageStatus::Skipped));
        assert_eq!(run.status_of("b"), Some(StageStatus::Skipped));
        assert!(h.script.calls().is_empty());
        assert!(
            drain(&mut rx)
                .iter()
                .all(|e| !matches!(e, OrchestrationEvent::StageStarted { .. }))
        );
    }

    /// Cancels the run from inside the call, so the completion and the
    /// cancel are both ready when the scheduler next polls.
    struct CancellingTools {
        cancel: CancellationToken,
        calls: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl crate::backend::ToolBackend for CancellingTools {
        async fn call_tool(&self, tool_id: &str, _args: &Value) -> Result<Value, CallError> {
            self.calls.lock().unwrap().push(tool_id.to_string());
            self.cancel.cancel();
            Ok(json!({ "tool": tool_id }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_arriving_with_completion_blocks_dependents() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let tools = BoxToolBackend::new(CancellingTools {
            cancel: cancel.clone(),
            calls: calls.clone(),
        });
        let h = harness_with_tools(4, Script::new(), tools);
        let g = graph(vec![tool("a"), tool("b").after(["a"]), tool("c").after(["b"])]);
        let (tx, _rx) = watch::channel(h.scheduler.initial_run(&g, Uuid::nil()));

        let run = h
            .scheduler
            .execute(&g, Uuid::now_v7(), json!({}), cancel, tx)
            .await;

        assert_eq!(*calls.lock().unwrap(), vec!["a".to_string()]);
        assert_eq!(run.outcome, RunOutcome::Cancelled);
        assert_eq!(run.status_of("a"), Some(StageStatus::Succeeded));
        assert_eq!(run.status_of("b"), Some(StageStatus::Skipped));
        assert_eq!(run.status_of("c"), Some(StageStatus::Skipped));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_marks_stage_cancelled() {
        let h = harness(4);
        h.script.fail_times("flaky", 5, CallError::Unavailable("503".into()));
        let mut flaky = StageSpec::new(
            "flaky",
            StageKind::Inference {
                capability: None,
                node: Some("flaky".into()),
            },
        );
        flaky.retry = Some(RetryPolicy {
            max_retries: 3,
            initial_backoff_ms: 10_000,
            max_backoff_ms: 10_000,
            multiplier: 1.0,
        });
        h.scheduler
            .runner
            .router()
            .registry()
            .register(switchyard_types::node::ModelNode::new("flaky", "sim://flaky", vec![]));
        let g = graph(vec![flaky]);
        let cancel = CancellationToken::new();
        let (tx, _rx) = watch::channel(h.scheduler.initial_run(&g, Uuid::nil()));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let run = h
            .scheduler
            .execute(&g, Uuid::now_v7(), json!({}), cancel, tx)
            .await;

        assert_eq!(run.status_of("flaky"), Some(StageStatus::Cancelled));
        assert_eq!(run.outcome, RunOutcome::Cancelled);
        assert_eq!(h.script.call_count("flaky"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_status_is_visible() {
        let h = harness(4);
        h.script.fail_times("n1", 1, CallError::Unavailable("503".into()));
        h.scheduler
            .runner
            .router()
            .registry()
            .register(switchyard_types::node::ModelNode::new("n1", "sim://n1", vec![]));
        let mut stage = StageSpec::new(
            "ask",
            StageKind::Inference {
                capability: None,
                node: None,
            },
        );
        stage.retry = Some(RetryPolicy::default());
        let g = graph(vec![stage]);
        let mut events = h.events.subscribe();

        let run = run(&h, &g, json!({})).await;
        let record = run.stage("ask").unwrap();
        assert_eq!(record.status, StageStatus::Succeeded);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.node_id.as_deref(), Some("n1"));
        assert!(
            drain(&mut events)
                .iter()
                .any(|e| matches!(e, OrchestrationEvent::StageRetrying { attempt: 1, .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dependencies_terminal_before_start() {
        let h = harness(3);
        h.script.default_delay(20);
        let g = graph(vec![
            tool("a"),
            tool("b"),
            tool("c").after(["a"]),
            tool("d").after(["b", "c"]),
            tool("e").after(["a", "d"]),
        ]);
        let (tx, mut rx) = watch::channel(h.scheduler.initial_run(&g, Uuid::nil()));
        let deps: Vec<Vec<usize>> = (0..g.stage_count())
            .map(|i| g.dependency_indices(i).to_vec())
            .collect();
        let checker = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                for (i, record) in snapshot.stages.iter().enumerate() {
                    if record.status.is_active() || record.status == StageStatus::Succeeded {
                        for &d in &deps[i] {
                            assert!(matches!(
                                snapshot.stages[d].status,
                                StageStatus::Succeeded | StageStatus::Skipped
                            ));
                        }
                    }
                }
            }
        });
        let run = h
            .scheduler
            .execute(&g, Uuid::now_v7(), json!({}), CancellationToken::new(), tx)
            .await;
        checker.await.unwrap();
        assert_eq!(run.outcome, RunOutcome::Succeeded);
    }
}
