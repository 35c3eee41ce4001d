//! CLI task subcommands.
//!
//! Tasks live in memory only, so the CLI offers the synchronous form: spawn,
//! wait, print.

use anyhow::Result;
use clap::Subcommand;
use console::style;
use prizm_types::task::{TaskMeta, TaskStatus};

use super::output::{print_json, styled_task_status};
use super::OutputMode;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Hand an instruction to the agent and wait for the result.
    Run {
        /// Instruction text.
        input: String,

        /// Short label shown in listings and events.
        #[arg(long)]
        label: Option<String>,

        /// Model override passed to the agent.
        #[arg(long)]
        model: Option<String>,

        /// Give up after this many milliseconds (default from config).
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

pub async fn handle_task_command(
    cmd: TaskCommand,
    state: &AppState,
    scope: &str,
    mode: OutputMode,
) -> Result<()> {
    match cmd {
        TaskCommand::Run {
            input,
            label,
            model,
            timeout_ms,
        } => {
            let meta = TaskMeta {
                label,
                model,
                ..TaskMeta::default()
            };
            let task = state.tasks.trigger_sync(scope, &input, meta, timeout_ms).await?;

            if mode.json {
                return print_json(&task);
            }
            if mode.quiet {
                if let Some(output) = &task.output {
                    println!("{output}");
                }
                return Ok(());
            }

            println!();
            println!(
                "  {} {} [{}]",
                style("Task").bold(),
                style(task.id).cyan(),
                styled_task_status(task.status)
            );
            if let Some(ms) = task.duration_ms {
                println!("  Duration: {ms} ms");
            }
            if let Some(session) = &task.session_id {
                println!("  Session: {session}");
            }
            match (task.status, &task.output, &task.error) {
                (TaskStatus::Completed, Some(output), _) => {
                    println!();
                    match output.as_str() {
                        Some(text) => println!("{text}"),
                        None => println!("{}", serde_json::to_string_pretty(output)?),
                    }
                }
                (_, _, Some(err)) => println!("  Error: {}", style(err).red()),
                _ => {}
            }
            println!();

            if task.status == TaskStatus::Failed {
                anyhow::bail!("task {} failed", task.id);
            }
            Ok(())
        }
    }
}
