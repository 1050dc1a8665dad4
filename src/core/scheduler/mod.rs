pub mod spec;


use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::core::conversation::{ConversationLocks, ConversationMessage};
use crate::core::memory::MemorySystem;

pub use spec::{Resolved, ScheduleKind, ScheduleSpec};

/// Callback bound by the `schedule_task` tool; re-enters the chat flow.
pub const EXECUTE_TASK_CALLBACK: &str = "execute_task";

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("schedule {0} not found")]
    NotFound(String),
    #[error("no callback named '{0}' is registered")]
    UnknownCallback(String),
    #[error("schedule storage failed: {0}")]
    Storage(String),
}

impl SchedulerError {
    fn storage(e: anyhow::Error) -> Self {
        SchedulerError::Storage(e.to_string())
    }
}

/// A registered deferred task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Schedule {
    pub id: String,
    pub conversation_id: String,
    pub callback: String,
    pub payload: serde_json::Value,
    pub kind: ScheduleKind,
    pub cron: Option<String>,
    pub next_fire: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    pub fn description(&self) -> String {
        describe_payload(&self.payload)
    }
}

fn describe_payload(payload: &serde_json::Value) -> String {
    match payload.get("description").and_then(|d| d.as_str()) {
        Some(d) => d.to_string(),
        None => match payload {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// What a fired callback receives.
#[derive(Debug, Clone)]
pub struct FireContext {
    pub schedule_id: String,
    pub conversation_id: String,
    pub payload: serde_json::Value,
    pub fired_at: DateTime<Utc>,
}

#[async_trait]
pub trait ScheduleCallback: Send + Sync {
    async fn on_fire(&self, ctx: FireContext) -> Result<()>;
}

pub struct Scheduler {
    memory: Arc<MemorySystem>,
    clock: Arc<dyn Clock>,
    locks: ConversationLocks,
    callbacks: RwLock<HashMap<String, Arc<dyn ScheduleCallback>>>,
}

impl Scheduler {
    pub fn new(memory: Arc<MemorySystem>, clock: Arc<dyn Clock>, locks: ConversationLocks) -> Self {
        Self {
            memory,
            clock,
            locks,
            callbacks: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_callback(&self, name: &str, callback: Arc<dyn ScheduleCallback>) {
        info!("Registering schedule callback: {}", name);
        self.callbacks
            .write()
            .await
            .insert(name.to_string(), callback);
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn schedule(
        &self,
        conversation_id: &str,
        spec: &ScheduleSpec,
        callback: &str,
        payload: serde_json::Value,
    ) -> Result<Schedule, SchedulerError> {
        if !self.callbacks.read().await.contains_key(callback) {
            return Err(SchedulerError::UnknownCallback(callback.to_string()));
        }

        let now = self.clock.now();
        let resolved = spec.resolve(now)?;
        let schedule = Schedule {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            callback: callback.to_string(),
            payload,
            kind: resolved.kind,
            cron: resolved.cron,
            next_fire: resolved.next_fire,
            created_at: now,
        };
        self.memory
            .insert_schedule(&schedule)
            .await
            .map_err(SchedulerError::storage)?;

        info!(
            "Scheduled {} task {} for conversation {} at {}",
            schedule.kind.as_str(),
            schedule.id,
            conversation_id,
            schedule.next_fire
        );
        Ok(schedule)
    }

    pub async fn list(&self, conversation_id: Option<&str>) -> Result<Vec<Schedule>, SchedulerError> {
        self.memory
            .list_schedules(conversation_id)
            .await
            .map_err(SchedulerError::storage)
    }

    pub async fn get(&self, id: &str) -> Result<Schedule, SchedulerError> {
        self.memory
            .get_schedule(id)
            .await
            .map_err(SchedulerError::storage)?
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    /// Remove a schedule. A schedule already claimed by a fire (one-off) is
    /// gone, so cancelling it reports `NotFound`.
    pub async fn cancel(&self, id: &str) -> Result<(), SchedulerError> {
        let removed = self
            .memory
            .remove_schedule(id)
            .await
            .map_err(SchedulerError::storage)?;
        if !removed {
            return Err(SchedulerError::NotFound(id.to_string()));
        }
        info!("Cancelled schedule {}", id);
        Ok(())
    }

    /// Fire every schedule whose time has come. Returns how many fired.
    pub async fn fire_due(&self) -> Result<usize, SchedulerError> {
        let now = self.clock.now();
        let due = self
            .memory
            .due_schedules(now)
            .await
            .map_err(SchedulerError::storage)?;

        let mut fired = 0;
        for schedule in due {
            if self.fire_one(&schedule, now).await? {
                fired += 1;
            }
        }
        Ok(fired)
    }

    async fn fire_one(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<bool, SchedulerError> {
        let next_fire = match (schedule.kind, schedule.cron.as_deref()) {
            (ScheduleKind::Cron, Some(expr)) => match spec::next_cron_fire(expr, now) {
                Ok(next) => Some(next),
                Err(e) => {
                    warn!(
                        "Schedule {} cannot be rescheduled, firing one last time: {}",
                        schedule.id, e
                    );
                    None
                }
            },
            _ => None,
        };

        let message = ConversationMessage::user(
            &schedule.conversation_id,
            format!("Running scheduled task: {}", schedule.description()),
        );

        let claimed = {
            let _guard = self.locks.acquire(&schedule.conversation_id).await;
            self.memory
                .claim_schedule_fire(schedule, next_fire, &message)
                .await
                .map_err(SchedulerError::storage)?
        };
        if !claimed {
            info!("Schedule {} was cancelled before it fired", schedule.id);
            return Ok(false);
        }

        info!(
            "Fired schedule {} for conversation {}",
            schedule.id, schedule.conversation_id
        );

        let callback = self.callbacks.read().await.get(&schedule.callback).cloned();
        match callback {
            Some(callback) => {
                let ctx = FireContext {
                    schedule_id: schedule.id.clone(),
                    conversation_id: schedule.conversation_id.clone(),
                    payload: schedule.payload.clone(),
                    fired_at: now,
                };
                if let Err(e) = callback.on_fire(ctx).await {
                    error!("Callback '{}' for schedule {} failed: {}", schedule.callback, schedule.id, e);
                }
            }
            None => warn!(
                "Schedule {} fired but callback '{}' is not registered",
                schedule.id, schedule.callback
            ),
        }
        Ok(true)
    }
}

/// Periodic job that drives `fire_due` from the lifecycle's job scheduler.
pub fn tick_job(scheduler: Arc<Scheduler>, interval: Duration) -> Result<tokio_cron_scheduler::Job> {
    let job = tokio_cron_scheduler::Job::new_repeated_async(interval, move |_uuid, mut _l| {
        let scheduler = scheduler.clone();
        Box::pin(async move {
            if let Err(e) = scheduler.fire_due().await {
                error!("Scheduler tick failed: {}", e);
            }
        })
    })?;
    Ok(job)
}

#[cfg(test)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap() = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
