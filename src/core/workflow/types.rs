use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The fixed, linear ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    CreateRecord,
    GenerateEmbedding,
    UpsertVector,
}

impl StepName {
    pub const ALL: [StepName; 3] = [
        StepName::CreateRecord,
        StepName::GenerateEmbedding,
        StepName::UpsertVector,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepName::CreateRecord => "create_record",
            StepName::GenerateEmbedding => "generate_embedding",
            StepName::UpsertVector => "upsert_vector",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "create_record" => Some(StepName::CreateRecord),
            "generate_embedding" => Some(StepName::GenerateEmbedding),
            "upsert_vector" => Some(StepName::UpsertVector),
            _ => None,
        }
    }

    pub fn position(self) -> usize {
        match self {
            StepName::CreateRecord => 0,
            StepName::GenerateEmbedding => 1,
            StepName::UpsertVector => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(StepStatus::Pending),
            "completed" => Some(StepStatus::Completed),
            "failed" => Some(StepStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: StepName,
    pub status: StepStatus,
    pub result: Option<serde_json::Value>,
    pub attempts: u32,
}

impl StepRecord {
    pub fn pending(name: StepName) -> Self {
        Self {
            name,
            status: StepStatus::Pending,
            result: None,
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestInput {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub input: IngestInput,
    pub status: RunStatus,
    /// False once the run failed terminally; such runs refuse `resume`.
    pub retryable: bool,
    pub error: Option<String>,
    pub steps: Vec<StepRecord>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            input: IngestInput { text: text.into() },
            status: RunStatus::Running,
            retryable: true,
            error: None,
            steps: StepName::ALL.iter().map(|s| StepRecord::pending(*s)).collect(),
            created_at: Utc::now(),
        }
    }

    pub fn step(&self, name: StepName) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// First step not yet completed, in pipeline order.
    pub fn next_step(&self) -> Option<StepName> {
        StepName::ALL.into_iter().find(|name| {
            self.step(*name)
                .map(|s| s.status != StepStatus::Completed)
                .unwrap_or(true)
        })
    }

    /// Row id of the created document, once CreateRecord has completed.
    pub fn record_id(&self) -> Option<i64> {
        self.step(StepName::CreateRecord)
            .filter(|s| s.status == StepStatus::Completed)
            .and_then(|s| s.result.as_ref())
            .and_then(|r| r.get("record_id"))
            .and_then(|v| v.as_i64())
    }

    /// Checkpointed embedding, once GenerateEmbedding has completed.
    pub fn embedding(&self) -> Option<Vec<f32>> {
        self.step(StepName::GenerateEmbedding)
            .filter(|s| s.status == StepStatus::Completed)
            .and_then(|s| s.result.as_ref())
            .and_then(|r| r.get("embedding"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_run_starts_at_create_record() {
        let run = WorkflowRun::new("hello");
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.steps.len(), 3);
        assert_eq!(run.next_step(), Some(StepName::CreateRecord));
        assert!(run.record_id().is_none());
    }

    #[test]
    fn next_step_skips_completed_steps() {
        let mut run = WorkflowRun::new("hello");
        run.steps[0].status = StepStatus::Completed;
        run.steps[0].result = Some(serde_json::json!({"record_id": 7}));
        assert_eq!(run.next_step(), Some(StepName::GenerateEmbedding));
        assert_eq!(run.record_id(), Some(7));

        run.steps[1].status = StepStatus::Completed;
        run.steps[1].result = Some(serde_json::json!({"embedding": [0.5, 0.25]}));
        assert_eq!(run.embedding(), Some(vec![0.5, 0.25]));
        run.steps[2].status = StepStatus::Completed;
        assert_eq!(run.next_step(), None);
    }

    #[test]
    fn names_round_trip_through_storage_strings() {
        for name in StepName::ALL {
            assert_eq!(StepName::from_str(name.as_str()), Some(name));
        }
        for status in [RunStatus::Running, RunStatus::Completed, RunStatus::Failed] {
            assert_eq!(RunStatus::from_str(status.as_str()), Some(status));
        }
        assert!(StepStatus::from_str("bogus").is_none());
    }
}
