use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use super::MemorySystem;
use super::conversation::insert_message;
use crate::core::conversation::ConversationMessage;
use crate::core::scheduler::{Schedule, ScheduleKind};

const SCHEDULE_COLUMNS: &str =
    "id, conversation_id, callback, payload, kind, cron, next_fire_ms, created_at_ms";

fn row_to_schedule(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    let payload: String = row.get(3)?;
    let kind: String = row.get(4)?;
    let next_fire_ms: i64 = row.get(6)?;
    let created_at_ms: i64 = row.get(7)?;

    let conversion = |idx: usize, msg: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            msg.into(),
        )
    };

    Ok(Schedule {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        callback: row.get(2)?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion(3, e.to_string()))?,
        kind: ScheduleKind::from_str(&kind)
            .ok_or_else(|| conversion(4, format!("unknown schedule kind '{}'", kind)))?,
        cron: row.get(5)?,
        next_fire: millis_to_datetime(next_fire_ms).ok_or_else(|| conversion(6, "bad timestamp".into()))?,
        created_at: millis_to_datetime(created_at_ms)
            .ok_or_else(|| conversion(7, "bad timestamp".into()))?,
    })
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

impl MemorySystem {
    pub async fn insert_schedule(&self, schedule: &Schedule) -> Result<()> {
        let payload = serde_json::to_string(&schedule.payload)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO schedules (id, conversation_id, callback, payload, kind, cron, next_fire_ms, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                schedule.id,
                schedule.conversation_id,
                schedule.callback,
                payload,
                schedule.kind.as_str(),
                schedule.cron,
                schedule.next_fire.timestamp_millis(),
                schedule.created_at.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        let db = self.db.lock().await;
        let sql = format!("SELECT {} FROM schedules WHERE id = ?1", SCHEDULE_COLUMNS);
        let schedule = db.query_row(&sql, params![id], row_to_schedule).optional()?;
        Ok(schedule)
    }

    /// Active schedules ordered by next fire time, optionally for one conversation.
    pub async fn list_schedules(&self, conversation_id: Option<&str>) -> Result<Vec<Schedule>> {
        let db = self.db.lock().await;
        let mut results = Vec::new();
        match conversation_id {
            Some(conv) => {
                let sql = format!(
                    "SELECT {} FROM schedules WHERE conversation_id = ?1 ORDER BY next_fire_ms ASC, created_at_ms ASC",
                    SCHEDULE_COLUMNS
                );
                let mut stmt = db.prepare(&sql)?;
                let rows = stmt.query_map(params![conv], row_to_schedule)?;
                for row in rows {
                    results.push(row?);
                }
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM schedules ORDER BY next_fire_ms ASC, created_at_ms ASC",
                    SCHEDULE_COLUMNS
                );
                let mut stmt = db.prepare(&sql)?;
                let rows = stmt.query_map([], row_to_schedule)?;
                for row in rows {
                    results.push(row?);
                }
            }
        }
        Ok(results)
    }

    pub async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM schedules WHERE next_fire_ms <= ?1 ORDER BY next_fire_ms ASC",
            SCHEDULE_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![now.timestamp_millis()], row_to_schedule)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn remove_schedule(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows_deleted = db.execute("DELETE FROM schedules WHERE id = ?1", params![id])?;
        Ok(rows_deleted > 0)
    }

    /// Atomically claim one fire of `schedule` and append its conversation
    /// message. The claim only succeeds if the row still carries the fire time
    /// it was read with: one-off schedules are deleted, recurring ones move to
    /// `next_fire`. Returns false when a concurrent cancel or fire got there
    /// first, in which case nothing is written.
    pub async fn claim_schedule_fire(
        &self,
        schedule: &Schedule,
        next_fire: Option<DateTime<Utc>>,
        message: &ConversationMessage,
    ) -> Result<bool> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let claimed = match next_fire {
            Some(next) => tx.execute(
                "UPDATE schedules SET next_fire_ms = ?1 WHERE id = ?2 AND next_fire_ms = ?3",
                params![
                    next.timestamp_millis(),
                    schedule.id,
                    schedule.next_fire.timestamp_millis()
                ],
            )?,
            None => tx.execute(
                "DELETE FROM schedules WHERE id = ?1 AND next_fire_ms = ?2",
                params![schedule.id, schedule.next_fire.timestamp_millis()],
            )?,
        };
        if claimed == 0 {
            return Ok(false);
        }
        insert_message(&tx, message)?;
        tx.commit()?;
        Ok(true)
    }
}
