//! BusinessFlow command-line entry point.
//!
//! Binary name: `bflow`
//!
//! Loads `config.toml`, installs tracing, opens the database and dispatches
//! to the command handler.

mod cli;
mod state;

use clap::Parser;

use cli::{Cli, Commands};
use state::{AppState, read_engine_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (data_dir, mut config) = read_engine_config().await;

    // CLI verbosity overrides the configured filter
    match cli.verbose {
        0 if cli.quiet => config.logging.level = "error".to_string(),
        0 => {}
        1 => config.logging.level = "info,businessflow=debug".to_string(),
        _ => config.logging.level = "trace".to_string(),
    }
    if let Err(e) = businessflow_observe::init_tracing(&config.logging) {
        eprintln!("failed to initialize tracing: {e}");
    }

    if let Commands::Worker {
        workers: Some(workers),
        ..
    } = &cli.command
    {
        anyhow::ensure!(*workers > 0, "--workers must be at least 1");
        config.workers = *workers;
    }

    let state = AppState::init(data_dir, config).await?;
    let result = dispatch(cli, &state).await;

    businessflow_observe::shutdown_tracing();
    result
}

async fn dispatch(cli: Cli, state: &AppState) -> anyhow::Result<()> {
    let json = cli.json;
    match cli.command {
        Commands::Publish { path } => cli::workflow::handle_publish(path, state, json).await,
        Commands::Workflows => cli::workflow::handle_list(state, json).await,
        Commands::Run {
            workflow_id,
            workflow_version,
            context,
            correlation_id,
            wait,
        } => {
            let args = cli::run::RunArgs {
                workflow_id,
                version: workflow_version,
                context,
                correlation_id,
                wait,
            };
            cli::run::handle_run(args, state, json).await
        }
        Commands::Status { run_id } => cli::run::handle_status(&run_id, state, json).await,
        Commands::Cancel { run_id } => cli::run::handle_cancel(&run_id, state, json).await,
        Commands::Runs {
            workflow_id,
            status,
            limit,
            cursor,
        } => {
            cli::run::handle_runs(
                &workflow_id,
                status.as_deref(),
                limit,
                cursor.as_deref(),
                state,
                json,
            )
            .await
        }
        Commands::Stats { workflow_id } => cli::workflow::handle_stats(&workflow_id, state, json).await,
        Commands::Fire {
            trigger,
            data,
            wait,
        } => cli::trigger::handle_fire(&trigger, data.as_deref(), wait, state, json).await,
        Commands::Worker { no_schedules, .. } => {
            cli::worker::handle_worker(state, no_schedules, cli.quiet || json).await
        }
    }
}
