use axum::{
    Json,
    extract::{Path, State},
};

use crate::core::scheduler::{EXECUTE_TASK_CALLBACK, Schedule, ScheduleSpec, SchedulerError};

use super::super::AppState;

fn schedule_json(s: &Schedule) -> serde_json::Value {
    serde_json::json!({
        "id": s.id,
        "conversation_id": s.conversation_id,
        "description": s.description(),
        "kind": s.kind.as_str(),
        "cron": s.cron,
        "next_fire": s.next_fire.to_rfc3339(),
    })
}

async fn list_json(state: &AppState, conversation: Option<&str>) -> Json<serde_json::Value> {
    match state.scheduler.list(conversation).await {
        Ok(schedules) => Json(serde_json::json!({
            "success": true,
            "schedules": schedules.iter().map(schedule_json).collect::<Vec<_>>()
        })),
        Err(e) => Json(serde_json::json!({ "success": false, "error": e.to_string() })),
    }
}

pub async fn get_conversation_schedules_endpoint(
    Path(conversation): Path<String>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    list_json(&state, Some(&conversation)).await
}

pub async fn get_all_schedules_endpoint(State(state): State<AppState>) -> Json<serde_json::Value> {
    list_json(&state, None).await
}

#[derive(serde::Deserialize)]
pub struct CreateScheduleRequest {
    when: ScheduleSpec,
    description: String,
}

pub async fn create_schedule_endpoint(
    Path(conversation): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<CreateScheduleRequest>,
) -> Json<serde_json::Value> {
    let description = payload.description.trim();
    if description.is_empty() {
        return Json(serde_json::json!({
            "success": false,
            "error": "description is required"
        }));
    }

    match state
        .scheduler
        .schedule(
            &conversation,
            &payload.when,
            EXECUTE_TASK_CALLBACK,
            serde_json::json!({ "description": description }),
        )
        .await
    {
        Ok(schedule) => Json(serde_json::json!({
            "success": true,
            "schedule": schedule_json(&schedule)
        })),
        Err(e) => Json(serde_json::json!({ "success": false, "error": e.to_string() })),
    }
}

pub async fn delete_schedule_endpoint(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    match state.scheduler.cancel(&id).await {
        Ok(()) => Json(serde_json::json!({
            "success": true,
            "message": format!("Schedule {} cancelled", id)
        })),
        Err(e @ SchedulerError::NotFound(_)) => Json(serde_json::json!({
            "success": false,
            "not_found": true,
            "error": e.to_string()
        })),
        Err(e) => Json(serde_json::json!({ "success": false, "error": e.to_string() })),
    }
}
