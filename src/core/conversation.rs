use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    Pending,
    Confirmed,
    Denied,
    Executed,
    Error,
}

impl InvocationState {
    pub fn as_str(self) -> &'static str {
        match self {
            InvocationState::Pending => "pending",
            InvocationState::Confirmed => "confirmed",
            InvocationState::Denied => "denied",
            InvocationState::Executed => "executed",
            InvocationState::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InvocationState::Denied | InvocationState::Executed | InvocationState::Error
        )
    }
}

/// Invocation states only move forward: pending -> confirmed|denied -> executed|error.
/// `Pending -> Error` is allowed for invocations that fail before a decision
/// matters (unknown tool).
pub fn can_transition(from: InvocationState, to: InvocationState) -> bool {
    match from {
        InvocationState::Pending => matches!(
            to,
            InvocationState::Confirmed | InvocationState::Denied | InvocationState::Error
        ),
        InvocationState::Confirmed => {
            matches!(to, InvocationState::Executed | InvocationState::Error)
        }
        InvocationState::Denied | InvocationState::Executed | InvocationState::Error => false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub state: InvocationState,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            arguments,
            state: InvocationState::Pending,
            result: None,
        }
    }

    /// Move to `next` if the state machine allows it. Returns false (and leaves
    /// the invocation untouched) for any regression.
    pub fn transition(&mut self, next: InvocationState) -> bool {
        if can_transition(self.state, next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub tool_invocations: Vec<ToolInvocation>,
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn new(conversation_id: &str, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.into(),
            tool_invocations: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn user(conversation_id: &str, content: impl Into<String>) -> Self {
        Self::new(conversation_id, Role::User, content)
    }

    pub fn assistant(
        conversation_id: &str,
        content: impl Into<String>,
        tool_invocations: Vec<ToolInvocation>,
    ) -> Self {
        let mut msg = Self::new(conversation_id, Role::Assistant, content);
        msg.tool_invocations = tool_invocations;
        msg
    }

    pub fn awaiting_confirmation(&self) -> bool {
        self.tool_invocations
            .iter()
            .any(|inv| inv.state == InvocationState::Pending)
    }
}

type LockMap = std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// One async mutex per conversation. Chat turns hold it for the whole turn and
/// scheduler fires hold it while appending their message, so the two never
/// interleave writes to the same history. Entries are dropped once no guard or
/// waiter references them.
#[derive(Clone, Default)]
pub struct ConversationLocks {
    inner: Arc<LockMap>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, conversation_id: &str) -> ConversationGuard {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = lock.clone().lock_owned().await;
        ConversationGuard {
            guard: Some(guard),
            lock,
            conversation_id: conversation_id.to_string(),
            map: Arc::clone(&self.inner),
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Held for the duration of a conversation's critical section.
pub struct ConversationGuard {
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<Mutex<()>>,
    conversation_id: String,
    map: Arc<LockMap>,
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map and one here: nobody else is waiting.
        let idle = Arc::strong_count(&self.lock) == 2
            && map
                .get(&self.conversation_id)
                .is_some_and(|l| Arc::ptr_eq(l, &self.lock));
        if idle {
            map.remove(&self.conversation_id);
        }
    }
}
