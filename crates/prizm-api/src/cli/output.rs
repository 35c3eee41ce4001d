//! Shared rendering helpers for CLI output.

use anyhow::{Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use prizm_types::task::TaskStatus;
use prizm_types::workflow::{RunStatus, StepStatus, WorkflowRun};
use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize output")?
    );
    Ok(())
}

pub fn new_table(header: Vec<Cell>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

pub fn short_id(id: &uuid::Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

pub fn status_cell(status: RunStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        RunStatus::Pending => cell.fg(Color::Yellow),
        RunStatus::Running => cell.fg(Color::Blue),
        RunStatus::Paused => cell.fg(Color::Magenta),
        RunStatus::Completed => cell.fg(Color::Green),
        RunStatus::Failed => cell.fg(Color::Red),
        RunStatus::Cancelled => cell.fg(Color::DarkYellow),
    }
}

fn step_status_cell(status: StepStatus) -> Cell {
    let label = serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{status:?}"));
    let cell = Cell::new(label);
    match status {
        StepStatus::Completed => cell.fg(Color::Green),
        StepStatus::Failed => cell.fg(Color::Red),
        StepStatus::WaitingApproval => cell.fg(Color::Magenta),
        StepStatus::Running => cell.fg(Color::Blue),
        _ => cell,
    }
}

pub fn styled_run_status(status: RunStatus) -> String {
    let text = status.as_str();
    match status {
        RunStatus::Completed => style(text).green().to_string(),
        RunStatus::Failed => style(text).red().to_string(),
        RunStatus::Paused => style(text).magenta().to_string(),
        RunStatus::Cancelled => style(text).yellow().to_string(),
        RunStatus::Pending | RunStatus::Running => style(text).blue().to_string(),
    }
}

pub fn styled_task_status(status: TaskStatus) -> String {
    let text = status.to_string();
    match status {
        TaskStatus::Completed => style(text).green().to_string(),
        TaskStatus::Failed => style(text).red().to_string(),
        TaskStatus::Cancelled => style(text).yellow().to_string(),
        _ => style(text).blue().to_string(),
    }
}

/// Run header, per-step table, and resume hint when paused.
pub fn display_run(run: &WorkflowRun, paused_prompt: Option<&str>) {
    println!();
    println!(
        "  {} {} ({})",
        style("Run").bold(),
        style(run.id).cyan(),
        style(&run.workflow_name).cyan()
    );
    println!("  Status: {}", styled_run_status(run.status));
    println!("  Trigger: {}", run.trigger_type);
    println!("  Started: {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(err) = &run.error {
        println!("  Error: {}", style(err).red());
    }
    println!();

    let mut table = new_table(vec![
        Cell::new("#"),
        Cell::new("Step").fg(Color::Cyan),
        Cell::new("Status"),
        Cell::new("Attempts"),
        Cell::new("Output / Error"),
    ]);
    for (index, result) in run.step_results.iter().enumerate() {
        let detail = match (&result.output, &result.error) {
            (_, Some(err)) => err.to_string(),
            (Some(output), None) => truncate(&output.to_string(), 80),
            (None, None) => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(index + 1),
            Cell::new(&result.step_id),
            step_status_cell(result.status),
            Cell::new(result.attempts),
            Cell::new(detail),
        ]);
    }
    println!("{table}");
    println!();

    if let Some(token) = &run.resume_token {
        if let Some(prompt) = paused_prompt {
            println!("  {} {}", style("Approval needed:").magenta().bold(), prompt);
        }
        println!(
            "  Approve: {}",
            style(format!("prizm workflow resume {token}")).dim()
        );
        println!(
            "  Deny:    {}",
            style(format!("prizm workflow resume {token} --deny")).dim()
        );
        println!();
    }
}

pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééé", 3), "éé…");
    }

    #[test]
    fn test_short_id() {
        let id = uuid::Uuid::nil();
        assert_eq!(short_id(&id), "00000000");
    }
}
