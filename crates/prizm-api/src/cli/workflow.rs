//! CLI workflow subcommands.
//!
//! Runs execute inside this process: `run` and `resume` wait for the run to
//! pause or finish. A run still going when the wait ends stays `running` in
//! the store and is picked up again by `prizm workflow recover`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Subcommand;
use comfy_table::{Cell, Color};
use console::style;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use prizm_core::flow::{export_flow_yaml, flow_document};
use prizm_core::workflow::definition::{load_workflow_file, parse_workflow_yaml};
use prizm_core::workflow::registry::DefLookup;
use prizm_core::workflow::runner::StartOptions;
use prizm_core::workflow::trigger::next_fire_times;
use prizm_types::event::EngineEvent;
use prizm_types::flow::FlowDocument;
use prizm_types::workflow::{RunFilter, RunStatus, WorkflowRun};

use super::output::{display_run, new_table, print_json, short_id, status_cell};
use super::OutputMode;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Start a run of a registered workflow, or of a YAML file.
    Run {
        /// Registered workflow name, or a path to a `.yaml` file.
        target: String,

        /// Argument as `key=value`; the value is parsed as JSON when it can be.
        #[arg(long = "arg", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        args: Vec<(String, Value)>,

        /// All arguments as one JSON object (merged under `--arg`).
        #[arg(long)]
        args_json: Option<String>,

        /// Seconds to wait for the run to pause or finish.
        #[arg(long, default_value = "300")]
        wait_secs: u64,
    },

    /// Approve (or deny) a paused run by its resume token.
    Resume {
        token: String,

        /// Deny instead of approve; the run ends cancelled.
        #[arg(long)]
        deny: bool,

        #[arg(long, default_value = "300")]
        wait_secs: u64,
    },

    /// List recent runs.
    #[command(alias = "ls")]
    List {
        /// Only runs of this workflow.
        #[arg(long)]
        name: Option<String>,

        /// Only runs in this status (pending, running, paused, completed, failed, cancelled).
        #[arg(long, value_parser = parse_status)]
        status: Option<RunStatus>,

        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show one run with its step results.
    Status { run_id: Uuid },

    /// Cancel a run.
    Cancel { run_id: Uuid },

    /// Restart runs left pending or running by an earlier process.
    Recover {
        #[arg(long, default_value = "300")]
        wait_secs: u64,
    },

    /// Register (or replace) a definition from a YAML file.
    Register {
        file: PathBuf,

        #[arg(long)]
        description: Option<String>,
    },

    /// List registered definitions.
    Defs,

    /// Show a registered definition and its args schema.
    Show { name: String },

    /// Delete a registered definition.
    #[command(alias = "rm")]
    Delete { name: String },

    /// Parse and validate a YAML file without registering it.
    Validate { file: PathBuf },

    /// Convert an editor graph (JSON) into definition YAML.
    ExportFlow {
        /// Flow document: `{"meta": {...}, "nodes": [...], "edges": [...]}`.
        file: PathBuf,

        /// Write the YAML here instead of stdout.
        #[arg(long, short)]
        out: Option<PathBuf>,
    },

    /// Convert a definition (YAML file or registered name) into an editor graph.
    ImportFlow {
        target: String,

        #[arg(long, short)]
        out: Option<PathBuf>,
    },
}

fn parse_key_val(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn parse_status(raw: &str) -> Result<RunStatus, String> {
    serde_json::from_value(Value::String(raw.to_ascii_lowercase()))
        .map_err(|_| format!("unknown run status '{raw}'"))
}

fn looks_like_file(target: &str) -> bool {
    let path = Path::new(target);
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    ) || path.is_file()
}

pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    scope: &str,
    mode: OutputMode,
) -> Result<()> {
    match cmd {
        WorkflowCommand::Run {
            target,
            args,
            args_json,
            wait_secs,
        } => handle_run(state, scope, &target, args, args_json.as_deref(), wait_secs, mode).await,
        WorkflowCommand::Resume {
            token,
            deny,
            wait_secs,
        } => handle_resume(state, &token, !deny, wait_secs, mode).await,
        WorkflowCommand::List {
            name,
            status,
            limit,
        } => handle_list(state, scope, name, status, limit, mode).await,
        WorkflowCommand::Status { run_id } => {
            let run = state.runner.get_run(run_id).await?;
            render_run(&run, mode)
        }
        WorkflowCommand::Cancel { run_id } => handle_cancel(state, run_id, mode).await,
        WorkflowCommand::Recover { wait_secs } => handle_recover(state, wait_secs, mode).await,
        WorkflowCommand::Register { file, description } => {
            handle_register(state, scope, &file, description, mode).await
        }
        WorkflowCommand::Defs => handle_defs(state, scope, mode).await,
        WorkflowCommand::Show { name } => handle_show(state, scope, &name, mode).await,
        WorkflowCommand::Delete { name } => handle_delete(state, scope, &name, mode).await,
        WorkflowCommand::Validate { file } => handle_validate(&file, mode),
        WorkflowCommand::ExportFlow { file, out } => handle_export_flow(&file, out.as_deref(), mode).await,
        WorkflowCommand::ImportFlow { target, out } => {
            handle_import_flow(state, scope, &target, out.as_deref(), mode).await
        }
    }
}

// ---------------------------------------------------------------------------
// Run / resume
// ---------------------------------------------------------------------------

async fn handle_run(
    state: &AppState,
    scope: &str,
    target: &str,
    pairs: Vec<(String, Value)>,
    args_json: Option<&str>,
    wait_secs: u64,
    mode: OutputMode,
) -> Result<()> {
    let mut args = match args_json {
        Some(raw) => match serde_json::from_str::<Value>(raw).context("--args-json is not valid JSON")? {
            Value::Object(map) => map,
            _ => bail!("--args-json must be a JSON object"),
        },
        None => Map::new(),
    };
    args.extend(pairs);

    let events = state.events.subscribe();
    let options = StartOptions::with_args(args);
    let run_id = if looks_like_file(target) {
        let def = load_workflow_file(Path::new(target))
            .with_context(|| format!("failed to load workflow file '{target}'"))?;
        state.runner.start(scope, def, options).await?
    } else {
        state.runner.start_by_name(scope, target, options).await?
    };

    if !mode.json && !mode.quiet {
        eprintln!(
            "  {} run {}",
            style("started").green().bold(),
            style(run_id).cyan()
        );
    }
    let run = wait_with_progress(state, run_id, events, wait_secs, mode).await?;
    render_run(&run, mode)
}

async fn handle_resume(
    state: &AppState,
    token: &str,
    approved: bool,
    wait_secs: u64,
    mode: OutputMode,
) -> Result<()> {
    let events = state.events.subscribe();
    let resumed = state.runner.resume(token, approved).await?;
    let run = if resumed.status.is_settled() {
        resumed
    } else {
        wait_with_progress(state, resumed.id, events, wait_secs, mode).await?
    };
    render_run(&run, mode)
}

async fn handle_recover(state: &AppState, wait_secs: u64, mode: OutputMode) -> Result<()> {
    let recovered = state.runner.recover().await?;
    if !mode.json && !mode.quiet {
        println!("  Recovered {recovered} run(s).");
    }
    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait_secs);
    while state.runner.active_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if mode.json {
        print_json(&json!({ "recovered": recovered, "still_active": state.runner.active_count() }))?;
    }
    Ok(())
}

/// Wait for `run_id` to settle, echoing step progress to stderr.
async fn wait_with_progress(
    state: &AppState,
    run_id: Uuid,
    mut events: broadcast::Receiver<EngineEvent>,
    wait_secs: u64,
    mode: OutputMode,
) -> Result<WorkflowRun> {
    let settled = state
        .runner
        .wait_settled(run_id, Duration::from_secs(wait_secs));
    tokio::pin!(settled);

    let show = !mode.json && !mode.quiet;
    loop {
        tokio::select! {
            run = &mut settled => {
                let run = run?;
                while let Ok(event) = events.try_recv() {
                    if show && event.run_id() == Some(run_id) {
                        print_progress(&event);
                    }
                }
                if !run.status.is_settled() && show {
                    eprintln!(
                        "  {} run still {} after {wait_secs}s; finish it later with `prizm workflow recover`",
                        style("note:").yellow(),
                        run.status
                    );
                }
                return Ok(run);
            }
            event = events.recv() => match event {
                Ok(event) if event.run_id() == Some(run_id) => {
                    if show {
                        print_progress(&event);
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Ok(settled.await?),
            },
        }
    }
}

fn print_progress(event: &EngineEvent) {
    match event {
        EngineEvent::StepStarted {
            step_id, attempt, ..
        } if *attempt > 1 => {
            eprintln!("  {} {step_id} (attempt {attempt})", style("retry").yellow());
        }
        EngineEvent::StepStarted { step_id, .. } => {
            eprintln!("  {} {step_id}", style("step").dim());
        }
        EngineEvent::StepCompleted {
            step_id,
            duration_ms,
            ..
        } => {
            eprintln!("  {} {step_id} ({duration_ms} ms)", style("done").green());
        }
        EngineEvent::StepSkipped { step_id, .. } => {
            eprintln!("  {} {step_id}", style("skip").dim());
        }
        EngineEvent::StepFailed { step_id, error, .. } => {
            eprintln!("  {} {step_id}: {error}", style("fail").red());
        }
        EngineEvent::LinkedActionFailed { step_id, action, error, .. } => {
            eprintln!("  {} {action} after {step_id}: {error}", style("warn").yellow());
        }
        _ => {}
    }
}

fn render_run(run: &WorkflowRun, mode: OutputMode) -> Result<()> {
    if mode.json {
        return print_json(run);
    }
    if mode.quiet {
        if let Some(token) = &run.resume_token {
            println!("{token}");
        }
        return Ok(());
    }
    let prompt = run
        .step_results
        .get(run.current_step_index)
        .and_then(|r| r.output.as_ref())
        .and_then(|o| o.get("prompt"))
        .and_then(Value::as_str)
        .filter(|_| run.status == RunStatus::Paused);
    display_run(run, prompt);
    Ok(())
}

// ---------------------------------------------------------------------------
// List / cancel
// ---------------------------------------------------------------------------

async fn handle_list(
    state: &AppState,
    scope: &str,
    workflow_name: Option<String>,
    status: Option<RunStatus>,
    limit: u32,
    mode: OutputMode,
) -> Result<()> {
    let filter = RunFilter {
        workflow_name,
        status,
    };
    let runs = state.runner.list_runs(scope, &filter, limit).await?;

    if mode.json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!();
        println!("  No runs in scope '{scope}'.");
        println!();
        return Ok(());
    }

    let mut table = new_table(vec![
        Cell::new("Run ID").fg(Color::Cyan),
        Cell::new("Workflow"),
        Cell::new("Status"),
        Cell::new("Step"),
        Cell::new("Trigger"),
        Cell::new("Started"),
    ]);
    for r in &runs {
        table.add_row(vec![
            Cell::new(short_id(&r.id)),
            Cell::new(&r.workflow_name),
            status_cell(r.status),
            Cell::new(format!("{}/{}", r.current_step_index.min(r.total_steps), r.total_steps)),
            Cell::new(&r.trigger_type),
            Cell::new(r.created_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_cancel(state: &AppState, run_id: Uuid, mode: OutputMode) -> Result<()> {
    let cancelled = state.runner.cancel(run_id).await?;
    if mode.json {
        return print_json(&json!({ "run_id": run_id, "cancelled": cancelled }));
    }
    if mode.quiet {
        return Ok(());
    }
    if cancelled {
        println!("  {} Cancelled run {}", style("*").green().bold(), style(run_id).cyan());
    } else {
        println!("  Run {run_id} had already finished.");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

async fn handle_register(
    state: &AppState,
    scope: &str,
    file: &Path,
    description: Option<String>,
    mode: OutputMode,
) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let def = parse_workflow_yaml(&content)
        .with_context(|| format!("invalid workflow in {}", file.display()))?;
    let record = state
        .runner
        .registry()
        .register_def(scope, &def.name, &content, description, None)
        .await?;

    if mode.json {
        return print_json(&record);
    }
    if !mode.quiet {
        println!();
        println!(
            "  {} Registered workflow '{}'",
            style("*").green().bold(),
            style(&record.name).cyan()
        );
        println!("  ID: {}", record.id);
        println!("  Steps: {}", def.steps.len());
        println!("  Triggers: {}", record.triggers.len());
        println!();
    }
    Ok(())
}

async fn handle_defs(state: &AppState, scope: &str, mode: OutputMode) -> Result<()> {
    let defs = state.runner.registry().list_defs(scope).await?;
    if mode.json {
        return print_json(&defs);
    }
    if defs.is_empty() {
        println!();
        println!("  No workflows registered in scope '{scope}'.");
        println!(
            "  Register one with: {}",
            style("prizm workflow register <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = new_table(vec![
        Cell::new("Name").fg(Color::Cyan),
        Cell::new("Description"),
        Cell::new("Triggers"),
        Cell::new("Updated"),
    ]);
    for d in &defs {
        table.add_row(vec![
            Cell::new(&d.name),
            Cell::new(d.description.as_deref().unwrap_or("-")),
            Cell::new(d.triggers.len()),
            Cell::new(d.updated_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_show(state: &AppState, scope: &str, name: &str, mode: OutputMode) -> Result<()> {
    let found = state
        .runner
        .registry()
        .get_def_with_schema(scope, &DefLookup::Name(name.to_string()))
        .await?
        .with_context(|| format!("workflow '{name}' not found in scope '{scope}'"))?;

    if mode.json {
        return print_json(&found);
    }

    let def = &found.definition;
    println!();
    println!("  {} {}", style("Workflow").bold(), style(&def.name).cyan());
    if let Some(description) = &def.description {
        println!("  {description}");
    }
    println!("  ID: {}", found.record.id);
    println!();

    if !found.args_schema.is_empty() {
        let mut args = new_table(vec![
            Cell::new("Arg").fg(Color::Cyan),
            Cell::new("Required"),
            Cell::new("Default"),
            Cell::new("Description"),
        ]);
        for (arg, schema) in &found.args_schema {
            args.add_row(vec![
                Cell::new(arg),
                Cell::new(if schema.required { "yes" } else { "no" }),
                Cell::new(
                    schema
                        .default
                        .as_ref()
                        .map(Value::to_string)
                        .unwrap_or_else(|| "-".to_string()),
                ),
                Cell::new(schema.description.as_deref().unwrap_or("-")),
            ]);
        }
        println!("{args}");
        println!();
    }

    let mut steps = new_table(vec![
        Cell::new("#"),
        Cell::new("Step").fg(Color::Cyan),
        Cell::new("Type"),
        Cell::new("Condition"),
    ]);
    for (index, step) in def.steps.iter().enumerate() {
        steps.add_row(vec![
            Cell::new(index + 1),
            Cell::new(&step.id),
            Cell::new(step.kind.type_name()),
            Cell::new(step.condition.as_deref().unwrap_or("-")),
        ]);
    }
    println!("{steps}");
    println!();

    for trigger in &found.record.triggers {
        println!("  {} {}", style("Trigger").bold(), trigger.trigger_type);
        if let Some(schedule) = &trigger.schedule {
            match next_fire_times(schedule, Utc::now(), 3) {
                Ok(times) => {
                    for at in times {
                        println!("    next: {}", at.format("%Y-%m-%d %H:%M UTC"));
                    }
                }
                Err(e) => println!("    {} {e}", style("invalid schedule:").red()),
            }
        }
        for (key, value) in &trigger.filter {
            println!("    filter: {key} = {value}");
        }
        if let Some(when) = &trigger.when {
            println!("    when: {when}");
        }
    }
    if !found.record.triggers.is_empty() {
        println!();
    }
    Ok(())
}

async fn handle_delete(state: &AppState, scope: &str, name: &str, mode: OutputMode) -> Result<()> {
    let deleted = state.runner.registry().delete_def(scope, name).await?;
    if mode.json {
        return print_json(&json!({ "name": name, "deleted": deleted }));
    }
    if !deleted {
        bail!("workflow '{name}' not found in scope '{scope}'");
    }
    if !mode.quiet {
        println!("  {} Deleted workflow '{}'", style("*").green().bold(), style(name).cyan());
    }
    Ok(())
}

fn handle_validate(file: &Path, mode: OutputMode) -> Result<()> {
    match load_workflow_file(file) {
        Ok(def) => {
            if mode.json {
                print_json(&json!({ "valid": true, "name": def.name, "steps": def.steps.len() }))?;
            } else if !mode.quiet {
                println!(
                    "  {} '{}' is valid ({} steps)",
                    style("✓").green(),
                    def.name,
                    def.steps.len()
                );
            }
            Ok(())
        }
        Err(e) => {
            if mode.json {
                print_json(&json!({ "valid": false, "error": e.to_string() }))?;
            }
            Err(e).with_context(|| format!("{} is not a valid workflow", file.display()))
        }
    }
}

// ---------------------------------------------------------------------------
// Flow conversion
// ---------------------------------------------------------------------------

async fn write_or_print(out: Option<&Path>, content: &str) -> Result<()> {
    match out {
        Some(path) => tokio::fs::write(path, content)
            .await
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            print!("{content}");
            if !content.ends_with('\n') {
                println!();
            }
            Ok(())
        }
    }
}

async fn handle_export_flow(file: &Path, out: Option<&Path>, mode: OutputMode) -> Result<()> {
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let document: FlowDocument =
        serde_json::from_str(&raw).context("flow file is not a valid flow document")?;
    let yaml = export_flow_yaml(&document.graph.nodes, &document.graph.edges, &document.meta)?;

    if mode.json && out.is_none() {
        return print_json(&json!({ "yaml": yaml }));
    }
    write_or_print(out, &yaml).await
}

async fn handle_import_flow(
    state: &AppState,
    scope: &str,
    target: &str,
    out: Option<&Path>,
    _mode: OutputMode,
) -> Result<()> {
    let def = if looks_like_file(target) {
        load_workflow_file(Path::new(target))
            .with_context(|| format!("failed to load workflow file '{target}'"))?
    } else {
        state.runner.registry().load_def(scope, target).await?
    };
    let document = flow_document(&def);
    let rendered = serde_json::to_string_pretty(&document).context("failed to serialize flow")?;
    write_or_print(out, &rendered).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("topic=rust").unwrap(),
            ("topic".to_string(), json!("rust"))
        );
        assert_eq!(parse_key_val("n=3").unwrap(), ("n".to_string(), json!(3)));
        assert_eq!(
            parse_key_val("tags=[\"a\"]").unwrap(),
            ("tags".to_string(), json!(["a"]))
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("Paused").unwrap(), RunStatus::Paused);
        assert!(parse_status("crashed").is_err());
    }

    #[test]
    fn test_looks_like_file() {
        assert!(looks_like_file("flows/digest.yaml"));
        assert!(looks_like_file("digest.yml"));
        assert!(!looks_like_file("digest"));
    }
}
