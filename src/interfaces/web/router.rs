use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{delete, get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::handlers::{chat, ingest, schedules};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub(crate) fn build_api_router(state: AppState, api_port: u16) -> Router {
    Router::new()
        .route(
            "/api/conversations/{conversation}/chat",
            post(chat::chat_endpoint),
        )
        .route(
            "/api/conversations/{conversation}/messages",
            get(chat::get_messages_endpoint),
        )
        .route(
            "/api/conversations/{conversation}/schedules",
            get(schedules::get_conversation_schedules_endpoint)
                .post(schedules::create_schedule_endpoint),
        )
        .route("/api/schedules", get(schedules::get_all_schedules_endpoint))
        .route(
            "/api/schedules/{id}",
            delete(schedules::delete_schedule_endpoint),
        )
        .route("/api/ingest", post(ingest::ingest_endpoint))
        .route("/api/ingest/{run_id}", get(ingest::get_run_endpoint))
        .route("/api/logs", get(super::sse_logs_endpoint))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(api_port))
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent::AgentServices;
    use crate::core::config::Config;
    use crate::core::conversation::ConversationMessage;
    use crate::core::embedding::Embedder;
    use crate::core::llm::{LlmProvider, ModelReply, ProposedToolCall, ToolSpec};
    use anyhow::Result;
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tower::util::ServiceExt;

    /// Replies in order; plain "done" once the script runs out.
    struct ScriptedLlm {
        replies: Mutex<VecDeque<ModelReply>>,
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn complete(
            &self,
            _system_prompt: &str,
            _history: &[ConversationMessage],
            _tools: &[ToolSpec],
        ) -> Result<ModelReply> {
            Ok(self.replies.lock().await.pop_front().unwrap_or(ModelReply {
                text: "done".to_string(),
                tool_calls: Vec::new(),
            }))
        }
    }

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0, 0.0])
        }
    }

    struct TestApp {
        app: Router,
        _dir: tempfile::TempDir,
    }

    async fn test_app(replies: Vec<ModelReply>) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.embedding.dimensions = 3;
        let llm = Arc::new(ScriptedLlm {
            replies: Mutex::new(replies.into()),
        });
        let services = AgentServices::with_providers(&config, dir.path(), llm, Arc::new(FixedEmbedder))
            .await
            .unwrap();
        let (log_tx, _) = tokio::sync::broadcast::channel(16);
        let state = AppState {
            memory: services.memory,
            brain: services.brain,
            scheduler: services.scheduler,
            workflow: services.workflow,
            log_tx,
        };
        TestApp {
            app: build_api_router(state, 17890),
            _dir: dir,
        }
    }

    async fn json_request(
        app: &Router,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let body = match body {
            Some(json) => Body::from(serde_json::to_string(&json).unwrap()),
            None => Body::empty(),
        };

        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body_bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&body_bytes).unwrap_or(serde_json::json!({}));
        (status, json)
    }

    #[tokio::test]
    async fn security_headers_present_on_responses() {
        let t = test_app(Vec::new()).await;
        let req = Request::builder()
            .method(Method::GET)
            .uri("/api/schedules")
            .body(Body::empty())
            .unwrap();
        let resp = t.app.clone().oneshot(req).await.unwrap();

        assert_eq!(
            resp.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(resp.headers().get("x-frame-options").unwrap(), "DENY");
    }

    #[tokio::test]
    async fn chat_pauses_for_confirmation_and_resumes_on_approval() {
        let t = test_app(vec![
            ModelReply {
                text: String::new(),
                tool_calls: vec![ProposedToolCall {
                    id: "call_1".to_string(),
                    name: "get_weather_information".to_string(),
                    arguments: serde_json::json!({"city": "Paris"}),
                }],
            },
            ModelReply {
                text: "Paris looks fine today.".to_string(),
                tool_calls: Vec::new(),
            },
        ])
        .await;

        let (status, json) = json_request(
            &t.app,
            Method::POST,
            "/api/conversations/c1/chat",
            Some(serde_json::json!({"message": "What's the weather in Paris?"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["awaiting_confirmation"][0]["id"], "call_1");
        assert_eq!(
            json["awaiting_confirmation"][0]["tool_name"],
            "get_weather_information"
        );

        let (_, json) = json_request(
            &t.app,
            Method::POST,
            "/api/conversations/c1/chat",
            Some(serde_json::json!({"decisions": {"call_1": {"approved": true}}})),
        )
        .await;
        assert_eq!(json["success"], true);
        assert_eq!(json["response"], "Paris looks fine today.");
        assert!(json["awaiting_confirmation"].as_array().unwrap().is_empty());

        let (_, json) = json_request(
            &t.app,
            Method::GET,
            "/api/conversations/c1/messages",
            None,
        )
        .await;
        let messages = json["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["tool_invocations"][0]["state"], "executed");
    }

    #[tokio::test]
    async fn chat_without_message_or_decisions_is_rejected() {
        let t = test_app(Vec::new()).await;
        let (status, json) = json_request(
            &t.app,
            Method::POST,
            "/api/conversations/c1/chat",
            Some(serde_json::json!({"message": "   "})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn schedule_create_list_and_cancel() {
        let t = test_app(Vec::new()).await;
        let (_, created) = json_request(
            &t.app,
            Method::POST,
            "/api/conversations/c1/schedules",
            Some(serde_json::json!({
                "when": {"type": "delayed", "delayInSeconds": 600},
                "description": "stretch"
            })),
        )
        .await;
        assert_eq!(created["success"], true);
        assert_eq!(created["schedule"]["kind"], "delayed");
        let id = created["schedule"]["id"].as_str().unwrap().to_string();

        let (_, listed) =
            json_request(&t.app, Method::GET, "/api/conversations/c1/schedules", None).await;
        assert_eq!(listed["schedules"][0]["description"], "stretch");
        let (_, other) =
            json_request(&t.app, Method::GET, "/api/conversations/c2/schedules", None).await;
        assert!(other["schedules"].as_array().unwrap().is_empty());
        let (_, all) = json_request(&t.app, Method::GET, "/api/schedules", None).await;
        assert_eq!(all["schedules"].as_array().unwrap().len(), 1);

        let path = format!("/api/schedules/{}", id);
        let (_, cancelled) = json_request(&t.app, Method::DELETE, &path, None).await;
        assert_eq!(cancelled["success"], true);
        let (_, again) = json_request(&t.app, Method::DELETE, &path, None).await;
        assert_eq!(again["success"], false);
        assert_eq!(again["not_found"], true);
    }

    #[tokio::test]
    async fn invalid_schedule_spec_is_reported() {
        let t = test_app(Vec::new()).await;
        let (_, json) = json_request(
            &t.app,
            Method::POST,
            "/api/conversations/c1/schedules",
            Some(serde_json::json!({
                "when": {"type": "no-schedule"},
                "description": "never"
            })),
        )
        .await;
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("schedule"));
    }

    #[tokio::test]
    async fn ingest_runs_to_completion() {
        let t = test_app(Vec::new()).await;
        let (_, json) = json_request(
            &t.app,
            Method::POST,
            "/api/ingest",
            Some(serde_json::json!({"text": "hello"})),
        )
        .await;
        assert_eq!(json["success"], true);
        let path = format!("/api/ingest/{}", json["run_id"].as_str().unwrap());

        let mut status = serde_json::Value::Null;
        for _ in 0..50 {
            let (_, run) = json_request(&t.app, Method::GET, &path, None).await;
            status = run["run"]["status"].clone();
            if status == "completed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, "completed");
    }

    #[tokio::test]
    async fn unknown_run_and_empty_text_fail() {
        let t = test_app(Vec::new()).await;
        let (_, json) = json_request(&t.app, Method::GET, "/api/ingest/nope", None).await;
        assert_eq!(json["success"], false);
        let (_, json) = json_request(
            &t.app,
            Method::POST,
            "/api/ingest",
            Some(serde_json::json!({"text": ""})),
        )
        .await;
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn api_route_contract_has_all_expected_paths() {
        let paths = [
            "/api/conversations/c1/chat",
            "/api/conversations/c1/messages",
            "/api/conversations/c1/schedules",
            "/api/schedules",
            "/api/schedules/s1",
            "/api/ingest",
            "/api/ingest/r1",
            "/api/logs",
        ];
        let unique: HashSet<&str> = paths.iter().copied().collect();
        assert_eq!(unique.len(), paths.len(), "Duplicate routes found in route contract");

        let t = test_app(Vec::new()).await;
        for path in paths {
            let req = Request::builder()
                .method(Method::PUT)
                .uri(path)
                .body(Body::empty())
                .expect("request should build");
            let resp = t
                .app
                .clone()
                .oneshot(req)
                .await
                .expect("router oneshot should succeed");
            assert_eq!(
                resp.status(),
                StatusCode::METHOD_NOT_ALLOWED,
                "Route missing from router: {}",
                path
            );
        }
    }
}
