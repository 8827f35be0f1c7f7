//! CLI command definitions for the `syard` binary.

pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Validate, plan and run agent workflows.
#[derive(Parser)]
#[command(name = "syard", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed output (-v for verbose, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse and compile a workflow file.
    Validate {
        /// Workflow file (YAML, or JSON with a `.json` extension).
        file: PathBuf,
    },

    /// Show the execution waves of a workflow.
    Plan {
        /// Workflow file (YAML, or JSON with a `.json` extension).
        file: PathBuf,
    },

    /// Run a workflow against simulated backend nodes.
    Run {
        /// Workflow file (YAML, or JSON with a `.json` extension).
        file: PathBuf,

        /// Orchestrator configuration (TOML).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Run input as a JSON document.
        #[arg(long)]
        input: Option<String>,
    },
}
