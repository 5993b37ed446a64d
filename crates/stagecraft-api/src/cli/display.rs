//! Terminal rendering shared by the run commands.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use stagecraft_types::event::ProgressEvent;
use stagecraft_types::run::{RunReport, RunStatus, StageReport};
use stagecraft_types::stage::StageStatus;

pub fn run_status_cell(status: RunStatus) -> Cell {
    let color = match status {
        RunStatus::Initialized => Color::Yellow,
        RunStatus::Running => Color::Blue,
        RunStatus::Completed => Color::Green,
        RunStatus::Failed => Color::Red,
        RunStatus::BudgetExhausted => Color::Magenta,
        RunStatus::Cancelled => Color::DarkYellow,
    };
    Cell::new(status.to_string()).fg(color)
}

pub fn stage_status_cell(status: StageStatus) -> Cell {
    let color = match status {
        StageStatus::Pending => Color::Grey,
        StageStatus::Runnable => Color::Yellow,
        StageStatus::Running => Color::Blue,
        StageStatus::Completed => Color::Green,
        StageStatus::Failed => Color::Red,
        StageStatus::Skipped => Color::DarkGrey,
        StageStatus::Cancelled => Color::DarkYellow,
    };
    Cell::new(status.to_string()).fg(color)
}

fn stage_detail(stage: &StageReport) -> String {
    if let Some(err) = &stage.error {
        return err.to_string();
    }
    if let Some(reason) = &stage.skipped_because {
        return reason.clone();
    }
    String::new()
}

fn stage_duration(stage: &StageReport) -> String {
    match (stage.started_at, stage.finished_at) {
        (Some(start), Some(end)) => format!("{}ms", (end - start).num_milliseconds().max(0)),
        _ => "-".to_string(),
    }
}

/// Print a finished (or loaded) run.
pub fn print_report(report: &RunReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!();
    let marker = match report.status {
        RunStatus::Completed => style("*").green().bold(),
        RunStatus::Initialized | RunStatus::Running => style("~").blue().bold(),
        _ => style("!").red().bold(),
    };
    println!(
        "  {} Run {} of '{}': {}",
        marker,
        style(report.run_id).dim(),
        style(&report.workflow).cyan(),
        style(report.status).bold()
    );
    if let Some(error) = &report.error {
        println!("  {}", style(error).red());
    }
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Stage").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Duration"),
            Cell::new("Detail"),
        ]);
    for stage in &report.stages {
        table.add_row(vec![
            Cell::new(&stage.name),
            stage_status_cell(stage.status),
            Cell::new(stage.attempts),
            Cell::new(stage_duration(stage)),
            Cell::new(stage_detail(stage)),
        ]);
    }
    println!("{table}");

    if !report.budget.lines.is_empty() {
        println!();
        println!("  {}", style("Budget").bold());
        for (kind, line) in &report.budget.lines {
            match line.ceiling {
                Some(ceiling) => println!("    {kind}: {} / {ceiling}", line.consumed),
                None => println!("    {kind}: {}", line.consumed),
            }
        }
    }

    let has_output = report.output.as_object().is_some_and(|o| !o.is_empty());
    if has_output {
        println!();
        println!("  {}", style("Output").bold());
        println!("{}", serde_json::to_string_pretty(&report.output)?);
    }
    println!();
    Ok(())
}

/// One line per progress event.
pub fn format_event(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::RunStarted { workflow, .. } => {
            format!("  {} run started ({workflow})", style(">").cyan())
        }
        ProgressEvent::StageStatusChanged {
            stage_name,
            status,
            attempt,
            ..
        } => match status {
            StageStatus::Running => format!(
                "  {} {stage_name} running (attempt {attempt})",
                style("~").blue()
            ),
            StageStatus::Completed => format!("  {} {stage_name} completed", style("*").green()),
            StageStatus::Failed => format!("  {} {stage_name} failed", style("x").red()),
            other => format!("  {} {stage_name} {other}", style("-").dim()),
        },
        ProgressEvent::StageRetrying {
            stage_name,
            attempt,
            backoff_ms,
            error,
            ..
        } => format!(
            "  {} {stage_name} attempt {attempt} failed ({error}), retrying in {backoff_ms}ms",
            style("!").yellow()
        ),
        ProgressEvent::RunFinished { status, .. } => {
            format!("  {} run finished: {status}", style("<").cyan())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn retry_event_mentions_backoff() {
        let line = format_event(&ProgressEvent::StageRetrying {
            run_id: Uuid::now_v7(),
            stage_name: "draft".to_string(),
            attempt: 2,
            backoff_ms: 400,
            error: "transient: 503".to_string(),
            timestamp: Utc::now(),
        });
        assert!(line.contains("draft"));
        assert!(line.contains("400ms"));
    }

    #[test]
    fn detail_prefers_error_over_skip_reason() {
        let stage = StageReport {
            name: "a".to_string(),
            status: StageStatus::Skipped,
            attempts: 0,
            started_at: None,
            finished_at: None,
            error: None,
            skipped_because: Some("predecessor 'x' failed".to_string()),
        };
        assert_eq!(stage_detail(&stage), "predecessor 'x' failed");
        assert_eq!(stage_duration(&stage), "-");
    }
}
