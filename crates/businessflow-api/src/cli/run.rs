//! Run subcommands: start, inspect, cancel and list runs.

use std::sync::Arc;

use anyhow::{Context, Result};
use businessflow_core::workflow::WorkerPool;
use businessflow_types::execution::{ExecutionRun, RunFilter, RunStatus, RunStatusView};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use super::{
    parse_id, parse_json_arg, print_json, run_status_cell, step_status_cell, styled_run_status,
};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub struct RunArgs {
    pub workflow_id: String,
    pub version: Option<u32>,
    pub context: Option<String>,
    pub correlation_id: Option<String>,
    pub wait: bool,
}

pub async fn handle_run(args: RunArgs, state: &AppState, json: bool) -> Result<()> {
    let workflow_id = parse_id(&args.workflow_id, "workflow")?;
    let seed = parse_json_arg(args.context.as_deref(), "--context")?;

    let run_id = state
        .engine
        .create_run(workflow_id, args.version, seed, args.correlation_id)
        .await?;

    if args.wait {
        let run = execute_until_finished(state, run_id).await?;
        let view = state.engine.get_run_status(run.id).await?;
        return display_run(&view, json);
    }

    if json {
        return print_json(&serde_json::json!({
            "run_id": run_id.to_string(),
            "workflow_id": workflow_id.to_string(),
            "status": RunStatus::Pending.as_str(),
        }));
    }

    println!();
    println!(
        "  {} Started run {}",
        style("*").green().bold(),
        style(run_id).cyan()
    );
    println!();
    println!(
        "  Steps execute when a worker is running: {}",
        style("bflow worker").dim()
    );
    println!("  Check progress: {}", style(format!("bflow status {run_id}")).dim());
    println!();
    Ok(())
}

/// Drive `run_id` to a terminal status with an in-process worker pool.
pub async fn execute_until_finished(state: &AppState, run_id: Uuid) -> Result<ExecutionRun> {
    let pool = WorkerPool::new(Arc::clone(&state.engine));
    let shutdown = pool.shutdown_token();
    let worker = tokio::spawn(async move { pool.run().await });

    let result = tokio::select! {
        run = state.engine.wait_for_run(run_id) => run.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            Err(anyhow::anyhow!("interrupted; run {run_id} continues with the next worker"))
        }
    };

    shutdown.cancel();
    let processed = worker.await.context("worker pool panicked")?;
    tracing::debug!(%run_id, processed, "in-process worker stopped");
    result
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn handle_status(run_id: &str, state: &AppState, json: bool) -> Result<()> {
    let run_id = parse_id(run_id, "run")?;
    let view = state.engine.get_run_status(run_id).await?;
    display_run(&view, json)
}

fn display_run(view: &RunStatusView, json: bool) -> Result<()> {
    if json {
        return print_json(view);
    }

    let run = &view.run;
    println!();
    println!(
        "  {} {} ({})",
        style("Run").bold(),
        style(run.id).cyan(),
        styled_run_status(run.status)
    );
    println!(
        "  Workflow: {} v{} ({})",
        style(&run.workflow_name).cyan(),
        run.workflow_version,
        run.workflow_id
    );
    if let Some(correlation_id) = &run.correlation_id {
        println!("  Correlation: {correlation_id}");
    }
    if let Some(trigger_id) = &run.trigger_id {
        println!("  Trigger: {trigger_id}");
    }
    println!("  Created: {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(finished) = run.finished_at {
        println!("  Finished: {}", finished.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(err) = &run.error {
        println!("  Error: {}", style(err).red());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Last error"),
        ]);
    for step in &view.steps {
        let error = step
            .last_error
            .as_ref()
            .map(|e| e.to_string().chars().take(60).collect::<String>())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&step.step_id),
            step_status_cell(step.status),
            Cell::new(step.attempts),
            Cell::new(error),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

pub async fn handle_cancel(run_id: &str, state: &AppState, json: bool) -> Result<()> {
    let run_id = parse_id(run_id, "run")?;
    let status = state.engine.cancel_run(run_id).await?;

    if json {
        return print_json(&serde_json::json!({
            "run_id": run_id.to_string(),
            "status": status.as_str(),
        }));
    }

    println!();
    if status == RunStatus::Cancelled {
        println!("  {} Run {} cancelled", style("*").green().bold(), style(run_id).cyan());
    } else {
        println!(
            "  Run {} already finished as {}",
            style(run_id).cyan(),
            styled_run_status(status)
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

pub async fn handle_runs(
    workflow_id: &str,
    status: Option<&str>,
    limit: u32,
    cursor: Option<&str>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let workflow_id = parse_id(workflow_id, "workflow")?;
    let status = status
        .map(|s| s.parse::<RunStatus>().map_err(anyhow::Error::msg))
        .transpose()?;
    let filter = RunFilter {
        status,
        ..RunFilter::default()
    };
    let page = state
        .engine
        .list_runs_by_workflow(workflow_id, &filter, cursor, limit)
        .await?;

    if json {
        return print_json(&page);
    }

    if page.runs.is_empty() {
        println!();
        println!("  No runs for workflow {workflow_id}.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Version"),
            Cell::new("Trigger"),
            Cell::new("Created"),
            Cell::new("Finished"),
        ]);

    for r in &page.runs {
        let finished = r
            .finished_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(r.id),
            run_status_cell(r.status),
            Cell::new(r.workflow_version),
            Cell::new(r.trigger_id.as_deref().unwrap_or("manual")),
            Cell::new(r.created_at.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(finished),
        ]);
    }

    println!();
    println!("{table}");
    if let Some(next) = &page.next_cursor {
        println!(
            "  Next page: {}",
            style(format!("bflow runs {workflow_id} --cursor {next}")).dim()
        );
    }
    println!();
    Ok(())
}
