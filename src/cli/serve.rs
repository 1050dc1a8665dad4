use anyhow::Result;
use std::path::PathBuf;
use tracing::info;

use crate::core::agent::AgentInstance;
use crate::core::config::Config;
use crate::core::terminal::{print_link, print_status};
use crate::logging;

pub async fn run_server(
    config: Config,
    data_dir: PathBuf,
    api_host: String,
    api_port: u16,
) -> Result<()> {
    let (log_tx, _) = tokio::sync::broadcast::channel::<String>(500);
    logging::init_tracing(&config.log_level, log_tx.clone());

    info!("Starting agentdeck (model: {})...", config.llm.model);
    print_status("Data directory", &data_dir.display().to_string());
    print_link("API Endpoint", &format!("http://{}:{}/api", api_host, api_port));

    let instance = AgentInstance::boot(config, data_dir, api_host, api_port, log_tx).await?;
    instance.run().await
}
