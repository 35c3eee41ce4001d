//! Prizm CLI entry point.
//!
//! Binary name: `prizm`
//!
//! Parses CLI arguments, sets up tracing, opens the data directory, then
//! dispatches to the matching command handler.

mod cli;
mod state;

use std::io::Read;

use anyhow::Context;
use clap::Parser;
use clap_complete::generate;
use prizm_infra::config::resolve_data_dir;
use prizm_observe::tracing_setup::{init_tracing, shutdown_tracing, TracingOptions};
use serde_json::Value;

use cli::{Cli, Commands, OutputMode};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need tracing or app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "prizm", &mut std::io::stdout());
        return Ok(());
    }

    let tracing_options = TracingOptions {
        verbosity: if cli.quiet { 0 } else { cli.verbose },
        json: cli.log_json,
        otel: cli.otel,
    };
    init_tracing(&tracing_options).map_err(|e| anyhow::anyhow!("failed to set up tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mode = OutputMode {
        json: cli.json,
        quiet: cli.quiet,
    };
    let data_dir = cli.data_dir.unwrap_or_else(resolve_data_dir);
    tracing::debug!(data_dir = %data_dir.display(), scope = %cli.scope, "opening data dir");
    let state = AppState::init(data_dir).await?;

    match cli.command {
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &state, &cli.scope, mode).await
        }
        Commands::Task { action } => {
            cli::task::handle_task_command(action, &state, &cli.scope, mode).await
        }
        Commands::Tool { file } => {
            let raw = match file {
                Some(path) => tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("failed to read request from stdin")?;
                    buf
                }
            };
            let request: Value = serde_json::from_str(&raw).context("request is not valid JSON")?;
            let response = state.tools().call_json(&cli.scope, request).await;
            cli::output::print_json(&response)
        }
        Commands::Completions { .. } => Ok(()),
    }
}
