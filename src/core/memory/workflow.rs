use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::MemorySystem;
use super::knowledge::write_vector;
use crate::core::workflow::IngestionStore;
use crate::core::workflow::types::{
    IngestInput, RunStatus, StepName, StepRecord, StepStatus, WorkflowRun,
};

#[async_trait]
impl IngestionStore for MemorySystem {
    async fn create_run(&self, run: &WorkflowRun) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO workflow_runs (id, input, status, retryable, error, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.id,
                run.input.text,
                run.status.as_str(),
                run.retryable,
                run.error,
                run.created_at.timestamp_millis()
            ],
        )?;
        for step in &run.steps {
            let result = step.result.as_ref().map(|r| r.to_string());
            tx.execute(
                "INSERT INTO workflow_steps (run_id, position, name, status, result, attempts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run.id,
                    step.name.position() as i64,
                    step.name.as_str(),
                    step.status.as_str(),
                    result,
                    step.attempts
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        let db = self.db.lock().await;
        let header = db
            .query_row(
                "SELECT id, input, status, retryable, error, created_at_ms FROM workflow_runs WHERE id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, input, status, retryable, error, created_at_ms)) = header else {
            return Ok(None);
        };

        let mut stmt = db.prepare(
            "SELECT name, status, result, attempts FROM workflow_steps
             WHERE run_id = ?1 ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, u32>(3)?,
            ))
        })?;

        let mut steps = Vec::new();
        for row in rows {
            let (name, step_status, result, attempts) = row?;
            let name = StepName::from_str(&name)
                .ok_or_else(|| anyhow::anyhow!("Unknown workflow step '{}'", name))?;
            let step_status = StepStatus::from_str(&step_status)
                .ok_or_else(|| anyhow::anyhow!("Unknown step status '{}'", step_status))?;
            let result = match result {
                Some(raw) => Some(serde_json::from_str(&raw)?),
                None => None,
            };
            steps.push(StepRecord {
                name,
                status: step_status,
                result,
                attempts,
            });
        }

        let status = RunStatus::from_str(&status)
            .ok_or_else(|| anyhow::anyhow!("Unknown run status '{}'", status))?;
        let created_at: DateTime<Utc> = DateTime::from_timestamp_millis(created_at_ms)
            .ok_or_else(|| anyhow::anyhow!("Invalid timestamp on run {}", id))?;

        Ok(Some(WorkflowRun {
            id,
            input: IngestInput { text: input },
            status,
            retryable,
            error,
            steps,
            created_at,
        }))
    }

    async fn running_runs(&self) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id FROM workflow_runs WHERE status = 'running' ORDER BY created_at_ms ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    async fn save_step(&self, run_id: &str, step: &StepRecord) -> Result<()> {
        let result = step.result.as_ref().map(|r| r.to_string());
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO workflow_steps (run_id, position, name, status, result, attempts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(run_id, name) DO UPDATE SET
                status = excluded.status, result = excluded.result, attempts = excluded.attempts",
            params![
                run_id,
                step.name.position() as i64,
                step.name.as_str(),
                step.status.as_str(),
                result,
                step.attempts
            ],
        )?;
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        retryable: bool,
        error: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE workflow_runs SET status = ?1, retryable = ?2, error = ?3,
                updated_at = CURRENT_TIMESTAMP
             WHERE id = ?4",
            params![status.as_str(), retryable, error, run_id],
        )?;
        Ok(())
    }

    async fn create_record(&self, run_id: &str, text: &str, attempts: u32) -> Result<Option<i64>> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO documents (run_id, content) VALUES (?1, ?2)
             ON CONFLICT(run_id) DO NOTHING",
            params![run_id, text],
        )?;
        let record_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM documents WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(record_id) = record_id else {
            return Ok(None);
        };
        let result = serde_json::json!({ "record_id": record_id }).to_string();
        tx.execute(
            "UPDATE workflow_steps SET status = ?1, result = ?2, attempts = ?3
             WHERE run_id = ?4 AND name = ?5",
            params![
                StepStatus::Completed.as_str(),
                result,
                attempts,
                run_id,
                StepName::CreateRecord.as_str()
            ],
        )?;
        tx.commit()?;
        Ok(Some(record_id))
    }

    async fn upsert_vector(&self, record_id: i64, embedding: &[f32]) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        write_vector(&tx, record_id, embedding)?;
        tx.commit()?;
        Ok(())
    }

    async fn discard_record(&self, record_id: i64) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM vss_documents WHERE rowid = ?1", params![record_id])?;
        tx.execute("DELETE FROM documents WHERE id = ?1", params![record_id])?;
        tx.commit()?;
        Ok(())
    }

    fn vector_dimensions(&self) -> usize {
        self.vector_dims
    }
}
