pub mod generic_provider;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::core::conversation::ConversationMessage;

/// A tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A tool call proposed by the model in its reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    pub text: String,
    pub tool_calls: Vec<ProposedToolCall>,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    // One model completion over the full conversation history. Only terminal
    // tool invocations are sent back to the model with their results.
    async fn complete(
        &self,
        system_prompt: &str,
        history: &[ConversationMessage],
        tools: &[ToolSpec],
    ) -> Result<ModelReply>;
}
