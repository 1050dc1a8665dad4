use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::conversation::{
    ConversationLocks, ConversationMessage, InvocationState, Role, ToolInvocation,
};
use crate::core::llm::{LlmProvider, ProposedToolCall};
use crate::core::memory::MemorySystem;
use crate::core::resolver::{Decisions, resolve_invocations};
use crate::core::scheduler::{FireContext, ScheduleCallback};
use crate::tools::ToolRegistry;

#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub conversation_id: String,
    pub message: Option<String>,
    pub decisions: Decisions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingInvocation {
    pub id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnOutcome {
    pub response: String,
    pub awaiting_confirmation: Vec<PendingInvocation>,
    /// Model completions performed during the turn.
    pub steps: usize,
}

/// Whether the conversation is waiting on the model: the last message is
/// from the user (or system), or it is an assistant message whose tool calls
/// have all settled.
fn needs_model(history: &[ConversationMessage]) -> bool {
    match history.last() {
        None => false,
        Some(last) => match last.role {
            Role::User | Role::System => true,
            Role::Assistant => {
                !last.tool_invocations.is_empty()
                    && last.tool_invocations.iter().all(|inv| inv.is_terminal())
            }
        },
    }
}

/// Whether the turn has to stop for a human decision: the newest message is
/// an assistant message still holding an undecided invocation. Anything the
/// user or system said after an ignored prompt is answered normally.
fn blocked_on_confirmation(history: &[ConversationMessage]) -> bool {
    history
        .last()
        .is_some_and(|m| m.role == Role::Assistant && m.awaiting_confirmation())
}

fn pending_invocations(history: &[ConversationMessage]) -> Vec<PendingInvocation> {
    history
        .iter()
        .flat_map(|m| m.tool_invocations.iter())
        .filter(|inv| inv.state == InvocationState::Pending)
        .map(|inv| PendingInvocation {
            id: inv.id.clone(),
            tool_name: inv.tool_name.clone(),
            arguments: inv.arguments.clone(),
        })
        .collect()
}

fn to_invocation(call: ProposedToolCall) -> ToolInvocation {
    let id = if call.id.trim().is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        call.id
    };
    ToolInvocation::new(id, call.name, call.arguments)
}

/// Runs chat turns: resolve pending tool calls, ask the model, record what it
/// proposes, repeat until it answers or a tool needs the user's approval.
pub struct Brain {
    memory: Arc<MemorySystem>,
    llm: Arc<dyn LlmProvider>,
    registry: ToolRegistry,
    locks: ConversationLocks,
    system_prompt: String,
    max_steps: usize,
}

impl Brain {
    pub fn new(
        memory: Arc<MemorySystem>,
        llm: Arc<dyn LlmProvider>,
        registry: ToolRegistry,
        locks: ConversationLocks,
        system_prompt: impl Into<String>,
        max_steps: usize,
    ) -> Self {
        Self {
            memory,
            llm,
            registry,
            locks,
            system_prompt: system_prompt.into(),
            max_steps: max_steps.max(1),
        }
    }

    pub async fn run_turn(&self, req: TurnRequest, cancel: CancellationToken) -> Result<TurnOutcome> {
        let conversation_id = req.conversation_id.as_str();
        let _guard = self.locks.acquire(conversation_id).await;

        if let Some(text) = req.message.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            self.memory
                .append_message(&ConversationMessage::user(conversation_id, text))
                .await?;
        }

        let tools = self.registry.assemble().await;
        let specs = tools.specs();
        let mut history = self.memory.get_messages(conversation_id).await?;
        let mut steps = 0;
        let mut response = String::new();

        loop {
            let resolution = resolve_invocations(
                &mut history,
                &req.decisions,
                &tools,
                self.memory.as_ref(),
                &cancel,
            )
            .await;
            for index in &resolution.changed_messages {
                self.memory.update_message(&history[*index]).await?;
            }
            if !resolution.executed.is_empty() {
                info!(
                    "Conversation {}: ran {}",
                    conversation_id,
                    resolution.executed.join(", ")
                );
            }

            if blocked_on_confirmation(&history) {
                info!(
                    "Conversation {} awaiting confirmation for {} tool call(s)",
                    conversation_id,
                    resolution.awaiting.len()
                );
                break;
            }

            // Calls settled out of an older message still get reported.
            let settled_earlier = !resolution.changed_messages.is_empty();
            if !needs_model(&history) && !settled_earlier {
                break;
            }
            if steps >= self.max_steps {
                warn!(
                    "Conversation {} hit the step limit ({}), ending turn",
                    conversation_id, self.max_steps
                );
                break;
            }

            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => bail!("turn for conversation {} was cancelled", conversation_id),
                reply = self.llm.complete(&self.system_prompt, &history, &specs) => reply?,
            };
            steps += 1;

            let invocations: Vec<ToolInvocation> =
                reply.tool_calls.into_iter().map(to_invocation).collect();
            if !invocations.is_empty() {
                let names: Vec<&str> = invocations.iter().map(|i| i.tool_name.as_str()).collect();
                info!(
                    "Conversation {}: model proposed {}",
                    conversation_id,
                    names.join(", ")
                );
            }
            let message = ConversationMessage::assistant(conversation_id, reply.text.clone(), invocations);
            self.memory.append_message(&message).await?;
            let proposed_tools = !message.tool_invocations.is_empty();
            history.push(message);
            response = reply.text;

            if !proposed_tools {
                break;
            }
        }

        Ok(TurnOutcome {
            response,
            awaiting_confirmation: pending_invocations(&history),
            steps,
        })
    }
}

/// Scheduler callback that re-enters the chat flow for the fired
/// conversation. The fire message is already in the history, so the turn
/// carries no new user text.
pub struct ExecuteTaskCallback {
    brain: Weak<Brain>,
}

impl ExecuteTaskCallback {
    pub fn new(brain: &Arc<Brain>) -> Self {
        Self {
            brain: Arc::downgrade(brain),
        }
    }
}

#[async_trait]
impl ScheduleCallback for ExecuteTaskCallback {
    async fn on_fire(&self, ctx: FireContext) -> Result<()> {
        let Some(brain) = self.brain.upgrade() else {
            bail!("agent is shutting down");
        };
        tokio::spawn(async move {
            let req = TurnRequest {
                conversation_id: ctx.conversation_id.clone(),
                ..TurnRequest::default()
            };
            match brain.run_turn(req, CancellationToken::new()).await {
                Ok(outcome) => info!(
                    "Scheduled task {} ran in conversation {} ({} step(s))",
                    ctx.schedule_id, ctx.conversation_id, outcome.steps
                ),
                Err(e) => error!(
                    "Scheduled task {} failed in conversation {}: {}",
                    ctx.schedule_id, ctx.conversation_id, e
                ),
            }
        });
        Ok(())
    }
}
