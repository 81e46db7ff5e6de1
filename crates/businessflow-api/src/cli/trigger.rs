//! `bflow fire`: deliver an event to a trigger binding.

use anyhow::Result;
use businessflow_types::execution::TriggerEvent;
use console::style;

use super::run::execute_until_finished;
use super::{parse_json_arg, print_json, styled_run_status};
use crate::state::AppState;

pub async fn handle_fire(
    trigger: &str,
    data: Option<&str>,
    wait: bool,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let event_data = parse_json_arg(data, "--data")?;

    let run_id = if trigger.starts_with('/') {
        state.engine.fire_webhook(trigger, event_data).await?
    } else {
        state
            .engine
            .fire_trigger(TriggerEvent::new(trigger, event_data))
            .await?
    };

    let Some(run_id) = run_id else {
        if json {
            return print_json(&serde_json::json!({ "trigger": trigger, "run_id": null }));
        }
        println!();
        println!(
            "  {} Trigger '{}' suppressed by its when clause",
            style("-").yellow().bold(),
            style(trigger).cyan()
        );
        println!();
        return Ok(());
    };

    let status = if wait {
        Some(execute_until_finished(state, run_id).await?.status)
    } else {
        None
    };

    if json {
        return print_json(&serde_json::json!({
            "trigger": trigger,
            "run_id": run_id.to_string(),
            "status": status.map(|s| s.as_str()),
        }));
    }

    println!();
    println!(
        "  {} Trigger '{}' started run {}",
        style("*").green().bold(),
        style(trigger).cyan(),
        style(run_id).cyan()
    );
    if let Some(status) = status {
        println!("  Finished as {}", styled_run_status(status));
    }
    println!();
    Ok(())
}
