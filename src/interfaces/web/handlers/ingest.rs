use axum::{
    Json,
    extract::{Path, State},
};

use crate::core::workflow::types::IngestInput;

use super::super::AppState;

/// Start an ingestion run in the background and hand back its id.
pub async fn ingest_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<IngestInput>,
) -> Json<serde_json::Value> {
    if payload.text.trim().is_empty() {
        return Json(serde_json::json!({
            "success": false,
            "error": "text is required"
        }));
    }

    match state.workflow.submit(&payload.text).await {
        Ok(run_id) => Json(serde_json::json!({ "success": true, "run_id": run_id })),
        Err(e) => Json(serde_json::json!({ "success": false, "error": e.to_string() })),
    }
}

pub async fn get_run_endpoint(
    Path(run_id): Path<String>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    match state.workflow.status(&run_id).await {
        Ok(Some(run)) => Json(serde_json::json!({ "success": true, "run": run })),
        Ok(None) => Json(serde_json::json!({
            "success": false,
            "error": format!("Ingestion run {} not found", run_id)
        })),
        Err(e) => Json(serde_json::json!({ "success": false, "error": e.to_string() })),
    }
}
