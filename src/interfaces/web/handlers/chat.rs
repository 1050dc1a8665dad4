use axum::{
    Json,
    extract::{Path, State},
};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::core::brain::TurnRequest;
use crate::core::resolver::Decisions;

use super::super::AppState;

#[derive(serde::Deserialize, Default)]
pub struct ChatRequest {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    decisions: Decisions,
}

/// Run one chat turn. A request may carry a new user message, decisions for
/// pending tool calls, or both.
pub async fn chat_endpoint(
    Path(conversation): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> Json<serde_json::Value> {
    let has_message = payload
        .message
        .as_deref()
        .is_some_and(|m| !m.trim().is_empty());
    if !has_message && payload.decisions.is_empty() {
        return Json(serde_json::json!({
            "success": false,
            "error": "message or decisions are required"
        }));
    }

    let req = TurnRequest {
        conversation_id: conversation.clone(),
        message: payload.message,
        decisions: payload.decisions,
    };

    // The turn runs on its own task. A disconnect drops this handler, and the
    // guard cancels in-flight tool calls so the turn records them as cancelled.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let brain = state.brain.clone();
    let turn = tokio::spawn(async move { brain.run_turn(req, cancel).await });

    let result = match turn.await {
        Ok(result) => result,
        Err(e) => Err(anyhow::anyhow!("chat turn task failed: {}", e)),
    };
    match result {
        Ok(outcome) => Json(serde_json::json!({
            "success": true,
            "response": outcome.response,
            "awaiting_confirmation": outcome.awaiting_confirmation,
            "steps": outcome.steps,
        })),
        Err(e) => {
            error!("Chat turn failed for conversation {}: {}", conversation, e);
            Json(serde_json::json!({ "success": false, "error": e.to_string() }))
        }
    }
}

pub async fn get_messages_endpoint(
    Path(conversation): Path<String>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    match state.memory.get_messages(&conversation).await {
        Ok(messages) => Json(serde_json::json!({
            "success": true,
            "messages": messages
        })),
        Err(e) => Json(serde_json::json!({ "success": false, "error": e.to_string() })),
    }
}
