//! Workflow subcommands: validate, plan and run.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use uuid::Uuid;

use switchyard_core::Orchestrator;
use switchyard_core::config::load_config;
use switchyard_core::workflow::{WorkflowGraph, load_workflow_file};
use switchyard_types::config::{NodeConfig, OrchestratorConfig};
use switchyard_types::error::WorkflowError;
use switchyard_types::event::OrchestrationEvent;
use switchyard_types::run::{PipelineRun, RunOutcome, StageStatus};
use switchyard_types::workflow::{StageKind, WorkflowDefinition};

use crate::simulated::{SimulatedInference, SimulatedTools};

/// Node registered by `run` when the configuration declares none.
const FALLBACK_NODE_ID: &str = "sim-local";

fn load(file: &Path) -> Result<(WorkflowDefinition, WorkflowGraph)> {
    let def = load_workflow_file(file).map_err(|e| match e {
        WorkflowError::Parse(msg) => anyhow::anyhow!("Failed to parse workflow: {msg}"),
        WorkflowError::Validation(msg) => anyhow::anyhow!("Workflow validation failed: {msg}"),
        other => anyhow::anyhow!("Failed to load workflow: {other}"),
    })?;
    let graph = WorkflowGraph::compile(&def)
        .with_context(|| format!("Invalid workflow graph in {}", file.display()))?;
    Ok((def, graph))
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let (_, graph) = load(file)?;
    let order = graph.topological_order();

    if json {
        let out = json!({
            "name": graph.name(),
            "valid": true,
            "stages": graph.stage_count(),
            "edges": graph.edges().len(),
            "topological_order": order,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Workflow '{}' is valid",
            style("*").green().bold(),
            style(graph.name()).cyan()
        );
        println!("  Stages: {}", graph.stage_count());
        println!("  Edges: {}", graph.edges().len());
        println!("  Order: {}", order.join(" -> "));
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

pub fn handle_plan(file: &Path, json: bool) -> Result<()> {
    let (_, graph) = load(file)?;
    let waves = graph.execution_waves();

    if json {
        let out = json!({
            "name": graph.name(),
            "max_parallelism": graph.max_parallelism(),
            "waves": waves,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Wave").fg(Color::Cyan),
            Cell::new("Stage"),
            Cell::new("Kind"),
            Cell::new("Depends On"),
            Cell::new("Condition"),
        ]);

    for (wave, stages) in waves.iter().enumerate() {
        for id in stages {
            let Some(stage) = graph.stage(id) else {
                continue;
            };
            table.add_row(vec![
                Cell::new(wave + 1),
                Cell::new(id),
                Cell::new(stage.kind.label()),
                Cell::new(graph.dependencies_of(id).join(", ")),
                Cell::new(stage.condition.as_deref().unwrap_or("-")),
            ]);
        }
    }

    println!();
    println!(
        "  Plan for '{}' ({} waves)",
        style(graph.name()).cyan(),
        waves.len()
    );
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(
    file: &Path,
    config_path: Option<&Path>,
    input: Option<&str>,
    json: bool,
) -> Result<()> {
    let (def, _) = load(file)?;
    let input: Value = match input {
        Some(raw) => serde_json::from_str(raw).context("--input is not valid JSON")?,
        None => json!({}),
    };

    let mut config = match config_path {
        Some(path) => load_config(path).await,
        None => OrchestratorConfig::default(),
    };
    if config.nodes.is_empty() {
        config.nodes.push(fallback_node(&def));
    }

    let inference = SimulatedInference::from_nodes(&config.nodes);
    let orchestrator = Orchestrator::builder(inference, SimulatedTools)
        .config(config)
        .build()
        .context("Invalid orchestrator configuration")?;

    let mut events = orchestrator.subscribe();
    let run_id = orchestrator.start_run(&def, input)?;
    if !json {
        println!();
        println!(
            "  {} Running '{}' ({})",
            style(">").cyan().bold(),
            style(&def.name).cyan(),
            run_id
        );
        print_progress(&mut events, run_id).await;
    }
    let run = orchestrator.wait_for_completion(run_id).await?;

    if json {
        let out = json!({
            "run": run,
            "nodes": orchestrator.node_health(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print_run(&run);
    }

    if run.outcome != RunOutcome::Succeeded {
        bail!("run {} finished {}", run.run_id, run.outcome);
    }
    Ok(())
}

/// A simulated node offering every capability the workflow asks for.
fn fallback_node(def: &WorkflowDefinition) -> NodeConfig {
    let capabilities: BTreeSet<String> = def
        .stages
        .iter()
        .filter_map(|s| match &s.kind {
            StageKind::Inference { capability, .. } => capability.clone(),
            _ => None,
        })
        .collect();
    NodeConfig {
        id: FALLBACK_NODE_ID.to_string(),
        endpoint: format!("sim://{FALLBACK_NODE_ID}"),
        capabilities: capabilities.into_iter().collect(),
        max_in_flight: None,
        simulated_latency_ms: None,
    }
}

async fn print_progress(events: &mut broadcast::Receiver<OrchestrationEvent>, run_id: Uuid) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "progress display lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if event.run_id().is_some_and(|id| id != run_id) {
            continue;
        }
        match &event {
            OrchestrationEvent::StageStarted { stage_id, kind, .. } => {
                println!("    {} {stage_id} ({kind})", style("started").dim());
            }
            OrchestrationEvent::StageRetrying {
                stage_id,
                attempt,
                error,
                ..
            } => {
                println!(
                    "    {} {stage_id} after attempt {attempt}: {error}",
                    style("retrying").yellow()
                );
            }
            OrchestrationEvent::StageSucceeded {
                stage_id,
                duration_ms,
                ..
            } => {
                println!("    {} {stage_id} in {duration_ms}ms", style("done").green());
            }
            OrchestrationEvent::StageFailed { stage_id, error, .. } => {
                println!("    {} {stage_id}: {error}", style("failed").red());
            }
            OrchestrationEvent::StageSkipped {
                stage_id, reason, ..
            } => {
                println!("    {} {stage_id}: {reason}", style("skipped").dim());
            }
            OrchestrationEvent::NodeHealthChanged { node_id, healthy } => {
                let state = if *healthy { "healthy" } else { "unhealthy" };
                println!("    node {node_id} is now {state}");
            }
            OrchestrationEvent::RunCompleted { .. } => return,
            _ => {}
        }
    }
}

fn print_run(run: &PipelineRun) {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Stage").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Node"),
            Cell::new("Error"),
        ]);

    for stage in &run.stages {
        table.add_row(vec![
            Cell::new(&stage.stage_id),
            format_status(stage.status),
            Cell::new(stage.attempts),
            Cell::new(stage.node_id.as_deref().unwrap_or("-")),
            Cell::new(stage.error.as_deref().unwrap_or("")),
        ]);
    }

    println!();
    println!("{table}");
    let outcome = match run.outcome {
        RunOutcome::Succeeded => style(run.outcome.as_str()).green().bold(),
        RunOutcome::Failed => style(run.outcome.as_str()).red().bold(),
        RunOutcome::Cancelled | RunOutcome::Running => style(run.outcome.as_str()).yellow().bold(),
    };
    println!("  Outcome: {outcome}");
    println!();
}

fn format_status(status: StageStatus) -> Cell {
    let color = match status {
        StageStatus::Succeeded => Color::Green,
        StageStatus::Failed => Color::Red,
        StageStatus::Running | StageStatus::Retrying => Color::Yellow,
        StageStatus::Cancelled => Color::Magenta,
        StageStatus::Pending | StageStatus::Ready | StageStatus::Skipped => Color::DarkGrey,
    };
    Cell::new(status.as_str()).fg(color)
}
