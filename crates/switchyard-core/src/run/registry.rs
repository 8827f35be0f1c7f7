//! In-memory registry of pipeline runs.
//!
//! Each run is driven by its own task running the [`DagScheduler`]. The
//! registry keeps only the read side: a `watch::Receiver` with the latest
//! snapshot and the run's cancellation token. Status queries clone the
//! current snapshot and never touch scheduler state directly.

use chrono::Duration;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use switchyard_types::error::RunError;
use switchyard_types::run::PipelineRun;
use switchyard_types::workflow::WorkflowDefinition;

use crate::clock::SharedClock;
use crate::workflow::graph::WorkflowGraph;
use crate::workflow::scheduler::DagScheduler;

struct RunEntry {
    snapshot: watch::Receiver<PipelineRun>,
    cancel: CancellationToken,
}

pub struct RunRegistry {
    runs: DashMap<Uuid, RunEntry>,
    scheduler: DagScheduler,
    clock: SharedClock,
    /// How long finished runs stay queryable before `evict_expired` drops them.
    retention: Duration,
}

impl RunRegistry {
    pub fn new(scheduler: DagScheduler, clock: SharedClock, retention: Duration) -> Self {
        Self {
            runs: DashMap::new(),
            scheduler,
            clock,
            retention,
        }
    }

    /// Compile `definition` and start executing it in the background.
    ///
    /// Must be called from within a Tokio runtime. The definition is
    /// rejected before anything is scheduled if it is invalid. Finished runs
    /// past the retention window are evicted first.
    pub fn start_run(&self, definition: &WorkflowDefinition, input: Value) -> Result<Uuid, RunError> {
        self.evict_expired();
        let graph = WorkflowGraph::compile(definition)?;
        let run_id = Uuid::now_v7();
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(self.scheduler.initial_run(&graph, run_id));

        self.runs.insert(
            run_id,
            RunEntry {
                snapshot: rx,
                cancel: cancel.clone(),
            },
        );

        let scheduler = self.scheduler.clone();
        let span = tracing::info_span!("run", run_id = %run_id, workflow = graph.name());
        tokio::spawn(
            async move {
                scheduler.execute(&graph, run_id, input, cancel, tx).await;
            }
            .instrument(span),
        );

        Ok(run_id)
    }

    /// Latest snapshot of a run.
    pub fn get_run_status(&self, run_id: Uuid) -> Result<PipelineRun, RunError> {
        self.runs
            .get(&run_id)
            .map(|entry| entry.snapshot.borrow().clone())
            .ok_or(RunError::UnknownRunId(run_id))
    }

    /// Request cooperative cancellation.
    ///
    /// Repeated requests on a running run are acknowledged; a run that has
    /// already finished is rejected with `InvalidRunState`.
    pub fn cancel_run(&self, run_id: Uuid) -> Result<(), RunError> {
        let entry = self
            .runs
            .get(&run_id)
            .ok_or(RunError::UnknownRunId(run_id))?;
        let outcome = entry.snapshot.borrow().outcome;
        if outcome.is_finished() {
            return Err(RunError::InvalidRunState {
                run_id,
                outcome,
                operation: "cancel",
            });
        }
        tracing::info!(run_id = %run_id, "cancelling run");
        entry.cancel.cancel();
        Ok(())
    }

    /// Wait until the run has finished and return its final snapshot.
    pub async fn wait_for_completion(&self, run_id: Uuid) -> Result<PipelineRun, RunError> {
        let mut rx = self
            .runs
            .get(&run_id)
            .map(|entry| entry.snapshot.clone())
            .ok_or(RunError::UnknownRunId(run_id))?;

        if let Ok(run) = rx.wait_for(PipelineRun::is_finished).await {
            return Ok(run.clone());
        }
        // The scheduler task is gone; report whatever it last published.
        Ok(rx.borrow().clone())
    }

    /// Snapshots of every known run, oldest first.
    pub fn list_runs(&self) -> Vec<PipelineRun> {
        let mut runs: Vec<PipelineRun> = self
            .runs
            .iter()
            .map(|entry| entry.snapshot.borrow().clone())
            .collect();
        runs.sort_by_key(|run| run.run_id);
        runs
    }

    /// Forget a finished run and return its final snapshot.
    pub fn cleanup(&self, run_id: Uuid) -> Result<PipelineRun, RunError> {
        let snapshot = self.get_run_status(run_id)?;
        if !snapshot.is_finished() {
            return Err(RunError::InvalidRunState {
                run_id,
                outcome: snapshot.outcome,
                operation: "clean up",
            });
        }
        self.runs.remove(&run_id);
        Ok(snapshot)
    }

    /// Drop finished runs older than the retention window. Returns how many
    /// were removed.
    pub fn evict_expired(&self) -> usize {
        let cutoff = self.clock.now() - self.retention;
        let before = self.runs.len();
        self.runs.retain(|_, entry| {
            let run = entry.snapshot.borrow();
            !matches!(run.finished_at, Some(finished) if run.is_finished() && finished < cutoff)
        });
        let evicted = before.saturating_sub(self.runs.len());
        if evicted > 0 {
            tracing::debug!(evicted, "evicted expired runs");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

impl std::fmt::Debug for RunRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRegistry")
            .field("runs", &self.runs.len())
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}
