//! Workflow definition subcommands: publish, list and stats.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use businessflow_core::repository::ExecutionStore;
use businessflow_core::workflow::definition::{discover_definitions, load_definition_file};
use businessflow_types::workflow::WorkflowDefinition;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use super::{parse_id, print_json, run_status_cell};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Publish
// ---------------------------------------------------------------------------

pub async fn handle_publish(path: Option<PathBuf>, state: &AppState, json: bool) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => match &state.config.workflows_dir {
            Some(dir) => PathBuf::from(dir),
            None => state.data_dir.join("workflows"),
        },
    };

    let files = collect_definitions(&path)?;
    if files.is_empty() {
        bail!("No workflow files found under {}", path.display());
    }

    let mut published = Vec::with_capacity(files.len());
    for (file, def) in files {
        let def = state
            .engine
            .publish_definition(def)
            .await
            .with_context(|| format!("Failed to publish {}", file.display()))?;
        published.push((file, def));
    }

    if json {
        let out: Vec<_> = published
            .iter()
            .map(|(file, d)| {
                serde_json::json!({
                    "file": file.display().to_string(),
                    "id": d.id.to_string(),
                    "name": d.name,
                    "version": d.version,
                    "steps": d.steps.len(),
                    "triggers": d.triggers.len(),
                })
            })
            .collect();
        return print_json(&out);
    }

    println!();
    for (file, d) in &published {
        println!(
            "  {} Published '{}' v{} ({} steps, {} triggers)",
            style("*").green().bold(),
            style(&d.name).cyan(),
            d.version,
            d.steps.len(),
            d.triggers.len()
        );
        println!("    ID: {}", d.id);
        println!("    {}", style(file.display()).dim());
    }
    println!();
    Ok(())
}

fn collect_definitions(path: &Path) -> Result<Vec<(PathBuf, WorkflowDefinition)>> {
    if path.is_dir() {
        return discover_definitions(path)
            .with_context(|| format!("Failed to scan {}", path.display()));
    }
    let def = load_definition_file(path)
        .with_context(|| format!("Failed to load workflow {}", path.display()))?;
    Ok(vec![(path.to_path_buf(), def)])
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let defs = state.engine.store().list_definitions().await?;

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id.to_string(),
                    "name": d.name,
                    "version": d.version,
                    "active": d.is_active,
                    "steps": d.steps.len(),
                    "triggers": d.triggers.iter().map(|t| &t.id).collect::<Vec<_>>(),
                })
            })
            .collect();
        return print_json(&out);
    }

    if defs.is_empty() {
        println!();
        println!("  No workflows published.");
        println!("  Publish one with: {}", style("bflow publish <file.yaml>").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Version"),
            Cell::new("Active"),
            Cell::new("Steps"),
            Cell::new("Triggers"),
        ]);

    for d in &defs {
        let triggers = d
            .triggers
            .iter()
            .map(|t| format!("{} ({})", t.id, t.kind.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(vec![
            Cell::new(d.id),
            Cell::new(&d.name),
            Cell::new(d.version),
            Cell::new(if d.is_active { "yes" } else { "no" }),
            Cell::new(d.steps.len()),
            Cell::new(if triggers.is_empty() { "-".to_string() } else { triggers }),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

pub async fn handle_stats(workflow_id: &str, state: &AppState, json: bool) -> Result<()> {
    let workflow_id = parse_id(workflow_id, "workflow")?;
    let stats = state.engine.workflow_stats(workflow_id).await?;

    if json {
        return print_json(&stats);
    }

    println!();
    println!(
        "  {} {}",
        style("Workflow").bold(),
        style(workflow_id).cyan()
    );
    println!("  Total runs: {}", stats.total_runs);
    for (status, n) in &stats.by_status {
        println!("    {status}: {n}");
    }
    match stats.success_rate {
        Some(rate) => println!("  Success rate: {:.1}%", rate * 100.0),
        None => println!("  Success rate: -"),
    }

    if !stats.recent_runs.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Run").fg(Color::Cyan),
                Cell::new("Status"),
                Cell::new("Version"),
                Cell::new("Created"),
            ]);
        for r in &stats.recent_runs {
            table.add_row(vec![
                Cell::new(r.id),
                run_status_cell(r.status),
                Cell::new(r.workflow_version),
                Cell::new(r.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            ]);
        }
        println!();
        println!("  Recent runs");
        println!("{table}");
    }
    println!();
    Ok(())
}
