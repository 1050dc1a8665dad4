mod bootstrap;

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::brain::Brain;
use crate::core::config::Config;
use crate::core::lifecycle::LifecycleManager;
use crate::core::memory::MemorySystem;
use crate::core::scheduler::Scheduler;
use crate::core::workflow::{IngestionWorkflow, WorkflowRecovery};
use crate::interfaces::web::{ApiServer, AppState};

/// Shared handles every interface works against.
#[derive(Clone)]
pub struct AgentServices {
    pub memory: Arc<MemorySystem>,
    pub scheduler: Arc<Scheduler>,
    pub brain: Arc<Brain>,
    pub workflow: Arc<IngestionWorkflow>,
}

impl AgentServices {
    /// Wire the services without starting any background work. Used by the
    /// one-shot CLI commands.
    pub async fn open(config: &Config, data_dir: &Path) -> Result<Self> {
        bootstrap::init_core_subsystems(config, data_dir).await
    }

    #[cfg(test)]
    pub(crate) async fn with_providers(
        config: &Config,
        data_dir: &Path,
        llm: Arc<dyn crate::core::llm::LlmProvider>,
        embedder: Arc<dyn crate::core::embedding::Embedder>,
    ) -> Result<Self> {
        bootstrap::init_with_providers(config, data_dir, llm, embedder).await
    }
}

/// The long-running server process.
pub struct AgentInstance {
    pub data_dir: PathBuf,
    pub services: AgentServices,
    pub lifecycle: LifecycleManager,
}

impl AgentInstance {
    pub async fn boot(
        config: Config,
        data_dir: PathBuf,
        api_host: String,
        api_port: u16,
        log_tx: tokio::sync::broadcast::Sender<String>,
    ) -> Result<Self> {
        info!("Booting agentdeck at {:?}", data_dir);
        let services = bootstrap::init_core_subsystems(&config, &data_dir).await?;
        Self::assemble(config, data_dir, services, api_host, api_port, log_tx).await
    }

    async fn assemble(
        config: Config,
        data_dir: PathBuf,
        services: AgentServices,
        api_host: String,
        api_port: u16,
        log_tx: tokio::sync::broadcast::Sender<String>,
    ) -> Result<Self> {
        let mut lifecycle = LifecycleManager::new().await?;

        // 1. Scheduler tick
        bootstrap::schedule_tick(
            &mut lifecycle,
            &services.scheduler,
            config.scheduler.poll_interval_secs,
        )
        .await?;

        // 2. Resume ingestion runs a previous process left behind
        lifecycle.attach(Arc::new(Mutex::new(WorkflowRecovery::new(
            services.workflow.clone(),
        ))));

        // 3. HTTP API
        let state = AppState {
            memory: services.memory.clone(),
            brain: services.brain.clone(),
            scheduler: services.scheduler.clone(),
            workflow: services.workflow.clone(),
            log_tx,
        };
        lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(
            state, api_host, api_port,
        ))));

        Ok(Self {
            data_dir,
            services,
            lifecycle,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        info!("agentdeck entering RUN state at {:?}", self.data_dir);
        self.lifecycle.start().await?;

        tokio::signal::ctrl_c().await?;

        info!("agentdeck shutting down.");
        self.lifecycle.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::embedding::Embedder;
    use crate::core::lifecycle::LifecycleState;
    use crate::core::llm::{LlmProvider, ModelReply, ToolSpec};
    use crate::core::conversation::ConversationMessage;
    use crate::core::scheduler::{EXECUTE_TASK_CALLBACK, ScheduleSpec};
    use crate::core::workflow::types::RunStatus;
    use async_trait::async_trait;

    struct SilentLlm;

    #[async_trait]
    impl LlmProvider for SilentLlm {
        fn name(&self) -> &str {
            "silent"
        }
        async fn complete(
            &self,
            _system_prompt: &str,
            _history: &[ConversationMessage],
            _tools: &[ToolSpec],
        ) -> Result<ModelReply> {
            Ok(ModelReply {
                text: "ok".to_string(),
                tool_calls: Vec::new(),
            })
        }
    }

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.1, 0.2, 0.3])
        }
    }

    fn small_config() -> Config {
        let mut config = Config::default();
        config.embedding.dimensions = 3;
        config
    }

    async fn services(dir: &Path) -> AgentServices {
        AgentServices::with_providers(
            &small_config(),
            dir,
            Arc::new(SilentLlm),
            Arc::new(FixedEmbedder),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn services_register_the_task_callback() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(dir.path()).await;
        let schedule = services
            .scheduler
            .schedule(
                "conv",
                &ScheduleSpec::Delayed { delay_in_seconds: 60 },
                EXECUTE_TASK_CALLBACK,
                serde_json::json!({"description": "water the plants"}),
            )
            .await
            .unwrap();
        assert_eq!(services.scheduler.list(None).await.unwrap(), vec![schedule]);
    }

    #[tokio::test]
    async fn services_ingest_into_the_shared_store() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(dir.path()).await;
        let run = services.workflow.start("hello").await.unwrap();
        let done = services.workflow.run(&run.id).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        let hits = services
            .memory
            .search_knowledge(&[0.1, 0.2, 0.3], 1)
            .await
            .unwrap();
        assert_eq!(hits[0].content, "hello");
    }

    #[tokio::test]
    async fn instance_starts_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(dir.path()).await;
        let (log_tx, _) = tokio::sync::broadcast::channel(8);
        let mut instance = AgentInstance::assemble(
            small_config(),
            dir.path().to_path_buf(),
            services,
            "127.0.0.1".to_string(),
            0,
            log_tx,
        )
        .await
        .unwrap();

        instance.lifecycle.start().await.unwrap();
        assert_eq!(instance.lifecycle.state(), LifecycleState::Ready);
        instance.lifecycle.shutdown().await.unwrap();
        assert_eq!(instance.lifecycle.state(), LifecycleState::Shutdown);
    }
}
