//! `list`, `show` and `signal`.

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;
use uuid::Uuid;

use stagecraft_core::repository::run::RunRepository;
use stagecraft_types::config::ServerConfig;
use stagecraft_types::run::RunReport;
use stagecraft_types::stage::StageStatus;

use crate::cli::display::{print_report, run_status_cell};
use crate::state::AppState;

pub async fn handle_list(state: &AppState, limit: u32, json: bool) -> Result<()> {
    let runs = state.runs.list_runs(limit).await?;

    if json {
        let out: Vec<Value> = runs
            .iter()
            .map(|r| {
                serde_json::json!({
                    "id": r.id,
                    "workflow": r.workflow,
                    "status": r.status,
                    "stages": r.stages.len(),
                    "created_at": r.created_at,
                    "updated_at": r.updated_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs yet. Start one with `stagecraft run <file> --durable`.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Stages"),
            Cell::new("Created"),
            Cell::new("Updated"),
        ]);

    for r in &runs {
        let done = r
            .stages
            .iter()
            .filter(|s| s.status == StageStatus::Completed)
            .count();
        table.add_row(vec![
            Cell::new(r.id),
            Cell::new(&r.workflow),
            run_status_cell(r.status),
            Cell::new(format!("{done}/{}", r.stages.len())),
            Cell::new(r.created_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(r.updated_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn handle_show(state: &AppState, run_id: Uuid, json: bool) -> Result<()> {
    let record = state
        .runs
        .get_run(&run_id)
        .await?
        .with_context(|| format!("Run {run_id} not found"))?;
    print_report(&RunReport::from_record(&record), json)
}

/// Default server URL from `[server]` in config.toml.
pub fn server_url(config: &ServerConfig) -> String {
    format!("http://{}:{}", config.host, config.port)
}

/// POST the signal to a running `stagecraft serve`.
pub async fn handle_signal(
    server: &str,
    run_id: Uuid,
    name: &str,
    payload: Value,
    json: bool,
) -> Result<()> {
    let url = format!(
        "{}/api/v1/runs/{run_id}/signals/{name}",
        server.trim_end_matches('/')
    );
    let response = reqwest::Client::new()
        .post(&url)
        .json(&payload)
        .send()
        .await
        .with_context(|| format!("Failed to reach {server}"))?;

    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let message = body["errors"][0]["message"]
            .as_str()
            .unwrap_or("request failed")
            .to_string();
        bail!("HTTP {status}: {message}");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&body["data"])?);
    } else {
        let delivered = body["data"]["delivered"].as_bool().unwrap_or(false);
        println!();
        println!(
            "  {} Signal '{}' {} run {}",
            style("*").green().bold(),
            style(name).cyan(),
            if delivered { "delivered to" } else { "buffered for" },
            style(run_id).dim()
        );
        println!();
    }
    Ok(())
}
