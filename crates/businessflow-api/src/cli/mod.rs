//! CLI command definitions and shared output helpers for the `bflow` binary.
//!
//! Uses clap derive macros for argument parsing. Every command prints styled
//! text by default and machine-readable JSON with `--json`.

pub mod run;
pub mod trigger;
pub mod worker;
pub mod workflow;

use std::path::PathBuf;

use anyhow::{Context, Result};
use businessflow_types::execution::{RunStatus, StepStatus};
use clap::{Parser, Subcommand};
use comfy_table::{Cell, Color};
use serde_json::Value;
use uuid::Uuid;

/// Run and operate BusinessFlow workflows.
#[derive(Parser)]
#[command(name = "bflow", version, about, long_about = None)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Detailed logging (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Publish a workflow file, or every workflow file in a directory.
    Publish {
        /// YAML/JSON file or directory. Defaults to `workflows_dir` from config.
        path: Option<PathBuf>,
    },

    /// List published workflows (latest version of each).
    #[command(alias = "ls")]
    Workflows,

    /// Start a run of a workflow.
    Run {
        /// Workflow ID.
        workflow_id: String,

        /// Pin a definition version (defaults to the latest).
        #[arg(long = "version", value_name = "N")]
        workflow_version: Option<u32>,

        /// JSON object seeded into the run context.
        #[arg(long)]
        context: Option<String>,

        /// Correlation ID recorded on the run.
        #[arg(long)]
        correlation_id: Option<String>,

        /// Execute the run in this process and wait for it to finish.
        #[arg(long)]
        wait: bool,
    },

    /// Show a run and its steps.
    Status {
        /// Run ID.
        run_id: String,
    },

    /// Cancel a run.
    Cancel {
        /// Run ID.
        run_id: String,
    },

    /// List runs of a workflow, newest first.
    Runs {
        /// Workflow ID.
        workflow_id: String,

        /// Only runs with this status.
        #[arg(long)]
        status: Option<String>,

        /// Page size.
        #[arg(long, default_value = "20")]
        limit: u32,

        /// Cursor printed by the previous page.
        #[arg(long)]
        cursor: Option<String>,
    },

    /// Aggregate run statistics for a workflow.
    Stats {
        /// Workflow ID.
        workflow_id: String,
    },

    /// Fire a trigger by ID, or a webhook trigger by path (starting with '/').
    Fire {
        /// Trigger ID or webhook path.
        trigger: String,

        /// JSON event payload.
        #[arg(long)]
        data: Option<String>,

        /// Execute the created run in this process and wait for it.
        #[arg(long)]
        wait: bool,
    },

    /// Recover, then process steps and schedules until Ctrl+C.
    Worker {
        /// Override the global step concurrency.
        #[arg(long)]
        workers: Option<usize>,

        /// Do not start the cron scheduler.
        #[arg(long)]
        no_schedules: bool,
    },
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

pub fn parse_id(raw: &str, what: &str) -> Result<Uuid> {
    raw.parse::<Uuid>()
        .with_context(|| format!("Invalid {what} ID: '{raw}'"))
}

/// Parse an optional JSON argument; absent means `{}`.
pub fn parse_json_arg(raw: Option<&str>, what: &str) -> Result<Value> {
    match raw {
        None => Ok(Value::Object(Default::default())),
        Some(raw) => serde_json::from_str(raw).with_context(|| format!("Invalid JSON for {what}")),
    }
}

pub fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn run_status_cell(status: RunStatus) -> Cell {
    let color = match status {
        RunStatus::Pending => Color::Grey,
        RunStatus::Running => Color::Yellow,
        RunStatus::Succeeded => Color::Green,
        RunStatus::Failed => Color::Red,
        RunStatus::Cancelled => Color::DarkYellow,
    };
    Cell::new(status.as_str()).fg(color)
}

pub fn step_status_cell(status: Option<StepStatus>) -> Cell {
    let Some(status) = status else {
        return Cell::new("-").fg(Color::DarkGrey);
    };
    let color = match status {
        StepStatus::Queued => Color::Grey,
        StepStatus::Dispatched => Color::Yellow,
        StepStatus::Succeeded => Color::Green,
        StepStatus::Failed => Color::Red,
        StepStatus::Skipped => Color::Blue,
        StepStatus::Cancelled => Color::DarkYellow,
    };
    Cell::new(status.as_str()).fg(color)
}

pub fn styled_run_status(status: RunStatus) -> console::StyledObject<&'static str> {
    let s = console::style(status.as_str());
    match status {
        RunStatus::Succeeded => s.green(),
        RunStatus::Failed => s.red(),
        RunStatus::Running => s.yellow(),
        RunStatus::Cancelled | RunStatus::Pending => s.dim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags_parse() {
        let cli = Cli::parse_from([
            "bflow",
            "run",
            "0190c3c4-0000-7000-8000-000000000001",
            "--version",
            "3",
            "--context",
            r#"{"order":1}"#,
            "--wait",
            "-vv",
        ]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run {
                workflow_version,
                context,
                wait,
                ..
            } => {
                assert_eq!(workflow_version, Some(3));
                assert_eq!(context.as_deref(), Some(r#"{"order":1}"#));
                assert!(wait);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_json_arg() {
        assert_eq!(parse_json_arg(None, "context").unwrap(), serde_json::json!({}));
        assert_eq!(
            parse_json_arg(Some(r#"{"a":1}"#), "context").unwrap(),
            serde_json::json!({ "a": 1 })
        );
        assert!(parse_json_arg(Some("{nope"), "context").is_err());
        assert!(parse_id("not-a-uuid", "run").is_err());
    }
}
