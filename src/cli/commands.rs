use anyhow::Result;
use std::path::Path;

use crate::core::agent::AgentServices;
use crate::core::config::Config;
use crate::core::terminal::{print_error, print_info, print_schedule_line, print_success};
use crate::core::workflow::types::RunStatus;
use crate::logging;

fn init_cli_tracing(config: &Config) {
    let (log_tx, _) = tokio::sync::broadcast::channel::<String>(16);
    logging::init_tracing(&config.log_level, log_tx);
}

/// Ingest one document in the foreground and report how the run ended.
pub async fn run_ingest(config: &Config, data_dir: &Path, text: &str) -> Result<()> {
    init_cli_tracing(config);
    let services = AgentServices::open(config, data_dir).await?;

    let run = services.workflow.start(text).await?;
    let run = services.workflow.run(&run.id).await?;
    match run.status {
        RunStatus::Completed => {
            let record = run
                .record_id()
                .map(|id| id.to_string())
                .unwrap_or_else(|| "?".to_string());
            print_success(&format!("Ingested as record {} (run {})", record, run.id));
        }
        RunStatus::Failed => {
            let reason = run.error.clone().unwrap_or_default();
            if run.retryable {
                print_error(&format!(
                    "Run {} failed and can be resumed: {}",
                    run.id, reason
                ));
            } else {
                print_error(&format!("Run {} aborted: {}", run.id, reason));
            }
        }
        RunStatus::Running => print_info(&format!("Run {} is still running", run.id)),
    }
    Ok(())
}

pub async fn run_list_schedules(config: &Config, data_dir: &Path) -> Result<()> {
    init_cli_tracing(config);
    let services = AgentServices::open(config, data_dir).await?;

    let schedules = services.scheduler.list(None).await?;
    if schedules.is_empty() {
        print_info("No active schedules.");
        return Ok(());
    }
    for s in &schedules {
        print_schedule_line(
            &s.id,
            &s.next_fire.to_rfc3339(),
            s.kind.as_str(),
            &format!("{} ({})", s.description(), s.conversation_id),
        );
    }
    Ok(())
}
