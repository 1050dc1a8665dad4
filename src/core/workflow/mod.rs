pub mod types;


use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::core::config::WorkflowConfig;
use crate::core::embedding::Embedder;
use crate::core::lifecycle::LifecycleComponent;
use types::{RunStatus, StepName, StepRecord, StepStatus, WorkflowRun};

const MAX_BACKOFF_MS: u64 = 30_000;

/// Persistence the ingestion pipeline needs: run checkpoints, the document
/// table and the vector index.
#[async_trait]
pub trait IngestionStore: Send + Sync {
    async fn create_run(&self, run: &WorkflowRun) -> Result<()>;
    async fn load_run(&self, run_id: &str) -> Result<Option<WorkflowRun>>;
    /// Ids of runs still marked running, oldest first.
    async fn running_runs(&self) -> Result<Vec<String>>;
    async fn save_step(&self, run_id: &str, step: &StepRecord) -> Result<()>;
    async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        retryable: bool,
        error: Option<&str>,
    ) -> Result<()>;
    /// Insert the document for `run_id` and checkpoint CreateRecord in one
    /// transaction. `None` means the store produced no row.
    async fn create_record(&self, run_id: &str, text: &str, attempts: u32) -> Result<Option<i64>>;
    async fn upsert_vector(&self, record_id: i64, embedding: &[f32]) -> Result<()>;
    /// Remove a document and any vector keyed by it.
    async fn discard_record(&self, record_id: i64) -> Result<()>;
    fn vector_dimensions(&self) -> usize;
}

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Terminal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow run {0} not found")]
    NotFound(String),
    #[error("workflow run {0} failed terminally and cannot be resumed")]
    NotResumable(String),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }

    /// Delay before retry number `retry` (1-based), doubling each time and
    /// capped at 30 s.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.backoff.as_millis().min(u128::from(MAX_BACKOFF_MS)) as u64;
        let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(base.saturating_mul(factor).min(MAX_BACKOFF_MS))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&WorkflowConfig::default())
    }
}

/// What a single `advance` call did.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    Stepped(StepName),
    Finished,
    Failed { retryable: bool, error: String },
}

/// Three-step checkpointed ingestion: create record, embed, upsert vector.
pub struct IngestionWorkflow {
    store: Arc<dyn IngestionStore>,
    embedder: Arc<dyn Embedder>,
    retry: RetryPolicy,
    /// Runs currently being driven by this process.
    active: Mutex<HashSet<String>>,
}

/// Exclusive right to drive one run; released on drop.
struct RunClaim<'a> {
    active: &'a Mutex<HashSet<String>>,
    run_id: String,
}

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.run_id);
    }
}

impl IngestionWorkflow {
    pub fn new(
        store: Arc<dyn IngestionStore>,
        embedder: Arc<dyn Embedder>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            embedder,
            retry,
            active: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, run_id: &str) -> Option<RunClaim<'_>> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(run_id.to_string()) {
            return None;
        }
        Some(RunClaim {
            active: &self.active,
            run_id: run_id.to_string(),
        })
    }

    fn is_active(&self, run_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(run_id)
    }

    /// Persist a new run without executing it.
    pub async fn start(&self, text: &str) -> Result<WorkflowRun> {
        let run = WorkflowRun::new(text);
        self.store.create_run(&run).await?;
        info!("Ingestion run {} created ({} bytes)", run.id, text.len());
        Ok(run)
    }

    /// Persist a new run and drive it in the background. Returns the run id.
    pub async fn submit(self: &Arc<Self>, text: &str) -> Result<String> {
        let run = self.start(text).await?;
        let run_id = run.id.clone();
        let workflow = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = workflow.run(&run.id).await {
                error!("Ingestion run {} errored: {}", run.id, e);
            }
        });
        Ok(run_id)
    }

    pub async fn status(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        self.store.load_run(run_id).await
    }

    /// Drive a running run to a terminal state and return it. If this process
    /// is already driving the run, returns its current state instead.
    pub async fn run(&self, run_id: &str) -> Result<WorkflowRun> {
        let Some(_claim) = self.claim(run_id) else {
            info!("Ingestion run {} is already in progress", run_id);
            return self.load(run_id).await;
        };
        let mut run = self.load(run_id).await?;
        while run.status == RunStatus::Running {
            match self.advance(&mut run).await? {
                Advance::Stepped(step) => {
                    info!("Ingestion run {}: {} completed", run.id, step.as_str());
                }
                Advance::Finished => {
                    info!("Ingestion run {} completed", run.id);
                }
                Advance::Failed { retryable, error } => {
                    warn!(
                        "Ingestion run {} failed (retryable: {}): {}",
                        run.id, retryable, error
                    );
                }
            }
        }
        Ok(run)
    }

    /// Continue a run from its first incomplete step. Completed steps are
    /// skipped and their checkpointed outputs reused.
    pub async fn resume(&self, run_id: &str) -> Result<WorkflowRun> {
        let run = self.load(run_id).await?;
        match run.status {
            RunStatus::Completed => return Ok(run),
            RunStatus::Failed if !run.retryable => {
                return Err(WorkflowError::NotResumable(run_id.to_string()).into());
            }
            RunStatus::Failed => {
                self.store
                    .finish_run(run_id, RunStatus::Running, true, None)
                    .await?;
            }
            RunStatus::Running => {}
        }
        info!(
            "Resuming ingestion run {} at {}",
            run_id,
            run.next_step().map(|s| s.as_str()).unwrap_or("completion")
        );
        self.run(run_id).await
    }

    /// Resume every run left running by a previous process. Runs this process
    /// is already driving are skipped.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let ids: Vec<String> = self
            .store
            .running_runs()
            .await?
            .into_iter()
            .filter(|id| !self.is_active(id))
            .collect();
        let count = ids.len();
        for id in ids {
            if let Err(e) = self.resume(&id).await {
                error!("Failed to recover ingestion run {}: {}", id, e);
            }
        }
        if count > 0 {
            info!("Recovered {} interrupted ingestion run(s)", count);
        }
        Ok(count)
    }

    async fn load(&self, run_id: &str) -> Result<WorkflowRun> {
        self.store
            .load_run(run_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(run_id.to_string()).into())
    }

    /// Execute the next incomplete step, retrying transient failures.
    pub async fn advance(&self, run: &mut WorkflowRun) -> Result<Advance> {
        let Some(step) = run.next_step() else {
            self.store
                .finish_run(&run.id, RunStatus::Completed, true, None)
                .await?;
            run.status = RunStatus::Completed;
            return Ok(Advance::Finished);
        };

        let mut retry = 0;
        loop {
            let attempts = self.bump_attempts(run, step);
            let outcome = self.execute_step(run, step, attempts).await;
            match outcome {
                Ok(result) => {
                    let record = StepRecord {
                        name: step,
                        status: StepStatus::Completed,
                        result: Some(result),
                        attempts,
                    };
                    // CreateRecord checkpoints inside its own transaction.
                    if step != StepName::CreateRecord {
                        self.store.save_step(&run.id, &record).await?;
                    }
                    replace_step(run, record);
                    if step == StepName::UpsertVector {
                        self.store
                            .finish_run(&run.id, RunStatus::Completed, true, None)
                            .await?;
                        run.status = RunStatus::Completed;
                        return Ok(Advance::Finished);
                    }
                    return Ok(Advance::Stepped(step));
                }
                Err(StepError::Transient(msg)) => {
                    retry += 1;
                    if retry < self.retry.max_attempts {
                        let delay = self.retry.delay_for(retry);
                        warn!(
                            "Ingestion run {}: {} attempt {} failed, retrying in {:?}: {}",
                            run.id,
                            step.as_str(),
                            attempts,
                            delay,
                            msg
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    self.fail_step(run, step, attempts, &msg, true).await?;
                    return Ok(Advance::Failed {
                        retryable: true,
                        error: msg,
                    });
                }
                Err(StepError::Terminal(msg)) => {
                    self.fail_step(run, step, attempts, &msg, false).await?;
                    self.compensate(run).await;
                    return Ok(Advance::Failed {
                        retryable: false,
                        error: msg,
                    });
                }
            }
        }
    }

    fn bump_attempts(&self, run: &mut WorkflowRun, step: StepName) -> u32 {
        match run.steps.iter_mut().find(|s| s.name == step) {
            Some(record) => {
                record.attempts += 1;
                record.attempts
            }
            None => {
                let mut record = StepRecord::pending(step);
                record.attempts = 1;
                run.steps.push(record);
                1
            }
        }
    }

    async fn execute_step(
        &self,
        run: &WorkflowRun,
        step: StepName,
        attempts: u32,
    ) -> Result<serde_json::Value, StepError> {
        match step {
            StepName::CreateRecord => {
                let created = self
                    .store
                    .create_record(&run.id, &run.input.text, attempts)
                    .await
                    .map_err(|e| StepError::Transient(e.to_string()))?;
                match created {
                    Some(record_id) => Ok(serde_json::json!({ "record_id": record_id })),
                    None => Err(StepError::Terminal(
                        "document store returned no row".to_string(),
                    )),
                }
            }
            StepName::GenerateEmbedding => {
                let embedding = self
                    .embedder
                    .embed(&run.input.text)
                    .await
                    .map_err(|e| StepError::Transient(e.to_string()))?;
                let expected = self.store.vector_dimensions();
                if embedding.len() != expected {
                    return Err(StepError::Terminal(format!(
                        "embedding has {} dimensions, vector index expects {}",
                        embedding.len(),
                        expected
                    )));
                }
                Ok(serde_json::json!({ "embedding": embedding }))
            }
            StepName::UpsertVector => {
                let record_id = run.record_id().ok_or_else(|| {
                    StepError::Terminal("no checkpointed record id".to_string())
                })?;
                let embedding = run.embedding().ok_or_else(|| {
                    StepError::Terminal("no checkpointed embedding".to_string())
                })?;
                self.store
                    .upsert_vector(record_id, &embedding)
                    .await
                    .map_err(|e| StepError::Transient(e.to_string()))?;
                Ok(serde_json::json!({ "record_id": record_id }))
            }
        }
    }

    async fn fail_step(
        &self,
        run: &mut WorkflowRun,
        step: StepName,
        attempts: u32,
        msg: &str,
        retryable: bool,
    ) -> Result<()> {
        let record = StepRecord {
            name: step,
            status: StepStatus::Failed,
            result: Some(serde_json::json!({ "error": msg })),
            attempts,
        };
        self.store.save_step(&run.id, &record).await?;
        replace_step(run, record);
        self.store
            .finish_run(&run.id, RunStatus::Failed, retryable, Some(msg))
            .await?;
        run.status = RunStatus::Failed;
        run.retryable = retryable;
        run.error = Some(msg.to_string());
        if retryable {
            warn!("Ingestion run {} stopped at {}: {}", run.id, step.as_str(), msg);
        } else {
            error!("Ingestion run {} aborted at {}: {}", run.id, step.as_str(), msg);
        }
        Ok(())
    }

    /// Undo CreateRecord after a terminal failure so no document is left
    /// without its vector.
    async fn compensate(&self, run: &WorkflowRun) {
        let Some(record_id) = run.record_id() else {
            return;
        };
        match self.store.discard_record(record_id).await {
            Ok(()) => info!(
                "Ingestion run {}: removed record {} after terminal failure",
                run.id, record_id
            ),
            Err(e) => error!(
                "Ingestion run {}: failed to remove record {}: {}",
                run.id, record_id, e
            ),
        }
    }
}

fn replace_step(run: &mut WorkflowRun, record: StepRecord) {
    match run.steps.iter_mut().find(|s| s.name == record.name) {
        Some(existing) => *existing = record,
        None => run.steps.push(record),
    }
}

/// Boot-time recovery of interrupted ingestion runs.
pub struct WorkflowRecovery {
    workflow: Arc<IngestionWorkflow>,
}

impl WorkflowRecovery {
    pub fn new(workflow: Arc<IngestionWorkflow>) -> Self {
        Self { workflow }
    }
}

#[async_trait]
impl LifecycleComponent for WorkflowRecovery {
    async fn on_start(&mut self) -> Result<()> {
        let workflow = Arc::clone(&self.workflow);
        tokio::spawn(async move {
            if let Err(e) = workflow.recover_interrupted().await {
                error!("Ingestion recovery failed: {}", e);
            }
        });
        Ok(())
    }
}
