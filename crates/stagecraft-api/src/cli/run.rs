//! `run`, `resume` and `validate`.
//!
//! Runs are driven in the foreground. Ctrl+C cancels the run cooperatively:
//! in-flight stages end `cancelled`, pending ones are skipped, and the report
//! is still printed.

use std::path::Path;

use anyhow::{Context, Result, bail};
use console::style;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use stagecraft_core::backend::ExecutionBackend;
use stagecraft_core::controller::WorkflowController;
use stagecraft_core::definition::{check_task_bindings, load_workflow_file};
use stagecraft_core::repository::run::RunRepository;
use stagecraft_types::event::ProgressEvent;
use stagecraft_types::run::{RunReport, RunStatus, WorkflowRunRecord};

use crate::cli::display::{format_event, print_report};
use crate::state::AppState;
use crate::tasks::build_registry;

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(
    state: AppState,
    file: &Path,
    input: Value,
    durable: bool,
    max_concurrency: Option<usize>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let definition = load_workflow_file(file)
        .with_context(|| format!("Failed to load workflow {}", file.display()))?;
    let state = match max_concurrency {
        Some(n) => state.with_max_concurrency(n),
        None => state,
    };

    let report = if durable {
        let record = state.controller.create_run(&definition, input).await?;
        drive_foreground(&state.controller, record, json || quiet).await?
    } else {
        let controller = state.in_process_controller();
        let record = controller.create_run(&definition, input).await?;
        drive_foreground(&controller, record, json || quiet).await?
    };

    finish(&report, json, quiet)
}

/// Drive `record`, streaming progress unless `silent`, cancelling on Ctrl+C.
async fn drive_foreground<B: ExecutionBackend>(
    controller: &WorkflowController<B>,
    record: WorkflowRunRecord,
    silent: bool,
) -> Result<RunReport> {
    let run_id = record.id;
    let printer = (!silent).then(|| spawn_progress_printer(controller.subscribe(), run_id));

    let drive = controller.drive(record);
    tokio::pin!(drive);
    let report = tokio::select! {
        report = &mut drive => report?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("  {} cancelling run {run_id}...", style("!").yellow());
            controller.cancel(&run_id);
            drive.await?
        }
    };

    if let Some(printer) = printer {
        let _ = printer.await;
    }
    Ok(report)
}

fn spawn_progress_printer(
    mut rx: tokio::sync::broadcast::Receiver<ProgressEvent>,
    run_id: Uuid,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) if event.run_id() == run_id => {
                    println!("{}", format_event(&event));
                    if matches!(event, ProgressEvent::RunFinished { .. }) {
                        break;
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn finish(report: &RunReport, json: bool, quiet: bool) -> Result<()> {
    if !quiet || json {
        print_report(report, json)?;
    }
    if report.status != RunStatus::Completed {
        bail!("run {} finished with status {}", report.run_id, report.status);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Resume
// ---------------------------------------------------------------------------

pub async fn handle_resume(state: AppState, run_id: Uuid, json: bool, quiet: bool) -> Result<()> {
    let record = state
        .runs
        .get_run(&run_id)
        .await?
        .with_context(|| format!("Run {run_id} not found"))?;
    let report = if record.status.is_terminal() {
        RunReport::from_record(&record)
    } else {
        drive_foreground(&state.controller, record, json || quiet).await?
    };
    finish(&report, json, quiet)
}

/// Resume every non-terminal run, one after another.
pub async fn handle_resume_all(state: AppState, json: bool, quiet: bool) -> Result<()> {
    let incomplete = state.controller.backend().incomplete_runs().await?;
    if incomplete.is_empty() {
        if json {
            println!("[]");
        } else if !quiet {
            println!("  No interrupted runs.");
        }
        return Ok(());
    }

    let mut reports = Vec::with_capacity(incomplete.len());
    for record in incomplete {
        let run_id = record.id;
        if !json && !quiet {
            println!(
                "  {} Resuming {} ({})",
                style(">").cyan(),
                style(run_id).dim(),
                style(&record.workflow).cyan()
            );
        }
        match drive_foreground(&state.controller, record, json || quiet).await {
            Ok(report) => reports.push(report),
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "resume failed");
                if !json {
                    eprintln!("  {} {run_id}: {e}", style("x").red());
                }
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else if !quiet {
        for report in &reports {
            print_report(report, false)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// Parse, check structure and task bindings. Needs no database.
pub async fn handle_validate(data_dir: &Path, file: &Path, json: bool) -> Result<()> {
    let config = stagecraft_infra::config::load_engine_config(data_dir).await;
    let definition = load_workflow_file(file)
        .with_context(|| format!("Workflow {} is invalid", file.display()))?;
    let registry = build_registry(&config)?;
    check_task_bindings(&definition, &registry)?;

    if json {
        let out = serde_json::json!({
            "name": definition.name,
            "stages": definition.stages.len(),
            "valid": true,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Workflow '{}' is valid ({} stages)",
            style("*").green().bold(),
            style(&definition.name).cyan(),
            definition.stages.len()
        );
        println!();
    }
    Ok(())
}
