use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::core::brain::{Brain, ExecuteTaskCallback};
use crate::core::config::Config;
use crate::core::conversation::ConversationLocks;
use crate::core::embedding::{Embedder, HttpEmbedder};
use crate::core::lifecycle::LifecycleManager;
use crate::core::llm::LlmProvider;
use crate::core::llm::generic_provider::GenericProvider;
use crate::core::memory::MemorySystem;
use crate::core::scheduler::{self, EXECUTE_TASK_CALLBACK, Scheduler, SystemClock};
use crate::core::workflow::{IngestionWorkflow, RetryPolicy};
use crate::tools::ToolRegistry;
use crate::tools::builtin::BuiltinToolSource;
use crate::tools::manifest::ManifestToolSource;

use super::AgentServices;

/// Open the store and wire the scheduler, tools, brain and ingestion workflow
/// around it.
pub(super) async fn init_core_subsystems(config: &Config, data_dir: &Path) -> Result<AgentServices> {
    let embedder: Arc<dyn Embedder> = Arc::new(HttpEmbedder::from_config(&config.embedding));
    let llm: Arc<dyn LlmProvider> = Arc::new(GenericProvider::from_config(&config.llm));
    init_with_providers(config, data_dir, llm, embedder).await
}

pub(super) async fn init_with_providers(
    config: &Config,
    data_dir: &Path,
    llm: Arc<dyn LlmProvider>,
    embedder: Arc<dyn Embedder>,
) -> Result<AgentServices> {
    let memory = Arc::new(MemorySystem::new(data_dir, config.embedding.dimensions).await?);
    let locks = ConversationLocks::new();

    let scheduler = Arc::new(Scheduler::new(
        memory.clone(),
        Arc::new(SystemClock),
        locks.clone(),
    ));

    let mut registry = ToolRegistry::new();
    registry.register_source(Arc::new(BuiltinToolSource::new(
        scheduler.clone(),
        memory.clone(),
        embedder.clone(),
    )));
    registry.register_source(Arc::new(ManifestToolSource::new(data_dir.join("tools"))));

    let brain = Arc::new(Brain::new(
        memory.clone(),
        llm,
        registry,
        locks,
        config.llm.system_prompt.clone(),
        config.agent.max_steps,
    ));
    scheduler
        .register_callback(
            EXECUTE_TASK_CALLBACK,
            Arc::new(ExecuteTaskCallback::new(&brain)),
        )
        .await;

    let workflow = Arc::new(IngestionWorkflow::new(
        memory.clone(),
        embedder,
        RetryPolicy::from_config(&config.workflow),
    ));

    Ok(AgentServices {
        memory,
        scheduler,
        brain,
        workflow,
    })
}

/// Drive scheduler fires from the lifecycle's job scheduler.
pub(super) async fn schedule_tick(
    lifecycle: &mut LifecycleManager,
    scheduler: &Arc<Scheduler>,
    poll_interval_secs: u64,
) -> Result<()> {
    let interval = Duration::from_secs(poll_interval_secs.max(1));
    let job = scheduler::tick_job(scheduler.clone(), interval)?;
    lifecycle.scheduler.add(job).await?;
    info!("Scheduler tick registered every {:?}", interval);
    Ok(())
}
