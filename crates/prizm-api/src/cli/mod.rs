//! CLI command definitions for the `prizm` binary.
//!
//! Uses clap derive macros. Commands follow a noun-verb pattern
//! (`prizm workflow run`, `prizm task run`).

pub mod output;
pub mod task;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run and manage resumable agent workflows.
#[derive(Parser)]
#[command(name = "prizm", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit JSON log lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Data directory (defaults to $PRIZM_DATA_DIR, then ~/.prizm).
    #[arg(long, global = true, env = "PRIZM_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Scope that owns definitions, runs, and tasks.
    #[arg(long, global = true, default_value = "default")]
    pub scope: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register, run, resume, and inspect workflows.
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Spawn ad-hoc agent tasks.
    Task {
        #[command(subcommand)]
        action: task::TaskCommand,
    },

    /// Answer a JSON tool request read from stdin (or a file).
    Tool {
        /// File holding the request; stdin when omitted.
        file: Option<PathBuf>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Output preferences shared by every handler.
#[derive(Debug, Clone, Copy)]
pub struct OutputMode {
    pub json: bool,
    pub quiet: bool,
}
