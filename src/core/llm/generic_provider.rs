use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{LlmProvider, ModelReply, ProposedToolCall, ToolSpec};
use crate::core::config::{LlmConfig, api_key_from_env};
use crate::core::conversation::{ConversationMessage, Role};

// ── OpenAI-compatible request/response ──

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool<'a>>,
}

#[derive(Debug, Serialize, PartialEq)]
struct OpenAiMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OpenAiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl OpenAiMessage {
    fn text(role: &'static str, content: &str) -> Self {
        Self {
            role,
            content: Some(content.to_string()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[derive(Serialize)]
struct OpenAiTool<'a> {
    r#type: &'static str,
    function: OpenAiFunctionDef<'a>,
}

#[derive(Serialize)]
struct OpenAiFunctionDef<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct OpenAiToolCall {
    id: String,
    #[serde(default = "function_type")]
    r#type: String,
    function: OpenAiFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessageOwned,
}

#[derive(Deserialize)]
struct OpenAiMessageOwned {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCall>,
}

// ── Generic Provider ──

pub struct GenericProvider {
    name: String,
    base_url: String,
    model: String,
    api_key: String,
    client: Client,
}

impl GenericProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: String,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            client: Client::new(),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(
            "openai-compatible",
            config.base_url.clone(),
            config.model.clone(),
            api_key_from_env(&config.api_key_env),
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Flatten history into OpenAI chat messages. Assistant tool calls are only
/// replayed once they carry a result, each followed by its `tool` message.
fn build_messages(system_prompt: &str, history: &[ConversationMessage]) -> Vec<OpenAiMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    if !system_prompt.is_empty() {
        messages.push(OpenAiMessage::text("system", system_prompt));
    }

    for msg in history {
        match msg.role {
            Role::User => messages.push(OpenAiMessage::text("user", &msg.content)),
            Role::System => messages.push(OpenAiMessage::text("system", &msg.content)),
            Role::Assistant => {
                let answered: Vec<_> = msg
                    .tool_invocations
                    .iter()
                    .filter(|inv| inv.is_terminal() && inv.result.is_some())
                    .collect();

                if answered.is_empty() {
                    if !msg.content.is_empty() {
                        messages.push(OpenAiMessage::text("assistant", &msg.content));
                    }
                    continue;
                }

                messages.push(OpenAiMessage {
                    role: "assistant",
                    content: (!msg.content.is_empty()).then(|| msg.content.clone()),
                    tool_calls: answered
                        .iter()
                        .map(|inv| OpenAiToolCall {
                            id: inv.id.clone(),
                            r#type: function_type(),
                            function: OpenAiFunctionCall {
                                name: inv.tool_name.clone(),
                                arguments: inv.arguments.to_string(),
                            },
                        })
                        .collect(),
                    tool_call_id: None,
                });
                for inv in answered {
                    let content = match &inv.result {
                        Some(serde_json::Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => String::new(),
                    };
                    messages.push(OpenAiMessage {
                        role: "tool",
                        content: Some(content),
                        tool_calls: Vec::new(),
                        tool_call_id: Some(inv.id.clone()),
                    });
                }
            }
        }
    }
    messages
}

fn parse_tool_call(call: OpenAiToolCall) -> ProposedToolCall {
    let arguments = if call.function.arguments.trim().is_empty() {
        serde_json::json!({})
    } else {
        match serde_json::from_str(&call.function.arguments) {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    "Tool call {} has non-JSON arguments ({}), passing them through as text",
                    call.id, e
                );
                serde_json::Value::String(call.function.arguments)
            }
        }
    };
    ProposedToolCall {
        id: call.id,
        name: call.function.name,
        arguments,
    }
}

#[async_trait]
impl LlmProvider for GenericProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        system_prompt: &str,
        history: &[ConversationMessage],
        tools: &[ToolSpec],
    ) -> Result<ModelReply> {
        let req = OpenAiRequest {
            model: &self.model,
            messages: build_messages(system_prompt, history),
            tools: tools
                .iter()
                .map(|t| OpenAiTool {
                    r#type: "function",
                    function: OpenAiFunctionDef {
                        name: &t.name,
                        description: &t.description,
                        parameters: &t.parameters,
                    },
                })
                .collect(),
        };

        let mut request = self.client.post(self.endpoint()).json(&req);
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let res = request.send().await?;
        if !res.status().is_success() {
            return Err(anyhow!(
                "{} API Error: {}",
                self.name,
                res.text().await.unwrap_or_default()
            ));
        }
        let parsed: OpenAiResponse = res.json().await?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| anyhow!("{} returned no choices", self.name))?;

        Ok(ModelReply {
            text: message.content.unwrap_or_default(),
            tool_calls: message.tool_calls.into_iter().map(parse_tool_call).collect(),
        })
    }
}
