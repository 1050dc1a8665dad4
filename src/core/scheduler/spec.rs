use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::SchedulerError;

/// When a deferred task should fire, as supplied by the model or the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ScheduleSpec {
    Scheduled {
        date: DateTime<Utc>,
    },
    Delayed {
        #[serde(rename = "delayInSeconds")]
        delay_in_seconds: u64,
    },
    Cron {
        cron: String,
    },
    NoSchedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Scheduled,
    Delayed,
    Cron,
}

impl ScheduleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleKind::Scheduled => "scheduled",
            ScheduleKind::Delayed => "delayed",
            ScheduleKind::Cron => "cron",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(ScheduleKind::Scheduled),
            "delayed" => Some(ScheduleKind::Delayed),
            "cron" => Some(ScheduleKind::Cron),
            _ => None,
        }
    }
}

/// A spec normalized to a single absolute fire time.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub kind: ScheduleKind,
    pub next_fire: DateTime<Utc>,
    /// Normalized (seconds-first) cron expression for recurring schedules.
    pub cron: Option<String>,
}

impl ScheduleSpec {
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<Resolved, SchedulerError> {
        match self {
            ScheduleSpec::Scheduled { date } => Ok(Resolved {
                kind: ScheduleKind::Scheduled,
                next_fire: *date,
                cron: None,
            }),
            ScheduleSpec::Delayed { delay_in_seconds } => {
                let secs = i64::try_from(*delay_in_seconds).map_err(|_| {
                    SchedulerError::InvalidSchedule(format!(
                        "delay of {} seconds is too large",
                        delay_in_seconds
                    ))
                })?;
                let delay = Duration::try_seconds(secs).ok_or_else(|| {
                    SchedulerError::InvalidSchedule(format!(
                        "delay of {} seconds is too large",
                        delay_in_seconds
                    ))
                })?;
                let next_fire = now.checked_add_signed(delay).ok_or_else(|| {
                    SchedulerError::InvalidSchedule("delay overflows the calendar".to_string())
                })?;
                Ok(Resolved {
                    kind: ScheduleKind::Delayed,
                    next_fire,
                    cron: None,
                })
            }
            ScheduleSpec::Cron { cron } => {
                let normalized = normalize_cron(cron)?;
                let next_fire = next_cron_fire(&normalized, now)?;
                Ok(Resolved {
                    kind: ScheduleKind::Cron,
                    next_fire,
                    cron: Some(normalized),
                })
            }
            ScheduleSpec::NoSchedule => Err(SchedulerError::InvalidSchedule(
                "no schedule was given".to_string(),
            )),
        }
    }
}

/// Accept standard 5-field cron, or 6/7-field cron with a leading seconds
/// field. 5-field expressions fire at second zero.
pub fn normalize_cron(expr: &str) -> Result<String, SchedulerError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => format!("0 {}", fields.join(" ")),
        6 | 7 => fields.join(" "),
        n => {
            return Err(SchedulerError::InvalidSchedule(format!(
                "cron expression '{}' has {} fields, expected 5, 6 or 7",
                expr.trim(),
                n
            )));
        }
    };
    cron::Schedule::from_str(&normalized).map_err(|e| {
        SchedulerError::InvalidSchedule(format!("invalid cron expression '{}': {}", expr.trim(), e))
    })?;
    Ok(normalized)
}

/// First fire time strictly after `after` for a normalized cron expression.
pub fn next_cron_fire(
    normalized: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, SchedulerError> {
    let schedule = cron::Schedule::from_str(normalized).map_err(|e| {
        SchedulerError::InvalidSchedule(format!("invalid cron expression '{}': {}", normalized, e))
    })?;
    schedule.after(&after).next().ok_or_else(|| {
        SchedulerError::InvalidSchedule(format!(
            "cron expression '{}' never fires again",
            normalized
        ))
    })
}
