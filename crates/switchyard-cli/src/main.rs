//! Switchyard CLI entry point.
//!
//! Binary name: `syard`
//!
//! Parses CLI arguments, sets up tracing, then dispatches to the workflow
//! command handlers.

mod cli;
mod simulated;

use clap::Parser;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info,switchyard_core=debug",
        _ => "trace",
    };
    switchyard_observe::init_tracing(filter, cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = match cli.command {
        Commands::Validate { file } => cli::workflow::handle_validate(&file, cli.json),
        Commands::Plan { file } => cli::workflow::handle_plan(&file, cli.json),
        Commands::Run {
            file,
            config,
            input,
        } => {
            cli::workflow::handle_run(&file, config.as_deref(), input.as_deref(), cli.json).await
        }
    };

    switchyard_observe::shutdown_tracing();
    result
}
