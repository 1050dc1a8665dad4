use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::DateTime;
use rusqlite::{Connection, params};

use super::MemorySystem;
use crate::core::conversation::{ConversationMessage, Role};
use crate::core::resolver::ConfirmationLog;

/// Insert a message on an already-locked connection. Used directly by the
/// scheduler so the fire message joins its claim transaction.
pub(crate) fn insert_message(db: &Connection, msg: &ConversationMessage) -> Result<()> {
    let invocations = serde_json::to_string(&msg.tool_invocations)?;
    db.execute(
        "INSERT INTO messages (id, conversation_id, role, content, tool_invocations, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            msg.id,
            msg.conversation_id,
            msg.role.as_str(),
            msg.content,
            invocations,
            msg.created_at.timestamp_millis()
        ],
    )?;
    Ok(())
}

impl MemorySystem {
    pub async fn append_message(&self, msg: &ConversationMessage) -> Result<()> {
        let db = self.db.lock().await;
        insert_message(&db, msg)
    }

    /// Persist a message's content and invocation states. Returns false if the
    /// message does not exist.
    pub async fn update_message(&self, msg: &ConversationMessage) -> Result<bool> {
        let invocations = serde_json::to_string(&msg.tool_invocations)?;
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE messages SET content = ?1, tool_invocations = ?2 WHERE id = ?3",
            params![msg.content, invocations, msg.id],
        )?;
        Ok(rows > 0)
    }

    pub async fn get_messages(&self, conversation_id: &str) -> Result<Vec<ConversationMessage>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, conversation_id, role, content, tool_invocations, created_at_ms
             FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (id, conversation_id, role, content, invocations, created_at_ms) = row?;
            let role = Role::from_str(&role)
                .ok_or_else(|| anyhow::anyhow!("Unknown role '{}' on message {}", role, id))?;
            let created_at = DateTime::from_timestamp_millis(created_at_ms)
                .ok_or_else(|| anyhow::anyhow!("Invalid timestamp on message {}", id))?;
            results.push(ConversationMessage {
                id,
                conversation_id,
                role,
                content,
                tool_invocations: serde_json::from_str(&invocations)?,
                created_at,
            });
        }
        Ok(results)
    }
}

#[async_trait]
impl ConfirmationLog for MemorySystem {
    async fn record_confirmed(&self, message: &ConversationMessage) -> Result<()> {
        if !self.update_message(message).await? {
            bail!("message {} is not stored", message.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::core::conversation::{ConversationMessage, InvocationState, ToolInvocation};
    use crate::core::memory::test_memory_system;

    #[tokio::test]
    async fn messages_round_trip_in_insertion_order() {
        let (memory, _dir) = test_memory_system(3).await;
        let first = ConversationMessage::user("c1", "hi");
        let second = ConversationMessage::assistant(
            "c1",
            "",
            vec![ToolInvocation::new("call-1", "get_local_time", serde_json::json!({"location": "Oslo"}))],
        );
        memory.append_message(&first).await.unwrap();
        memory.append_message(&second).await.unwrap();
        memory
            .append_message(&ConversationMessage::user("other", "unrelated"))
            .await
            .unwrap();

        let history = memory.get_messages("c1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hi");
        assert_eq!(history[1].tool_invocations[0].tool_name, "get_local_time");
        assert_eq!(history[1].tool_invocations[0].arguments["location"], "Oslo");
    }

    #[tokio::test]
    async fn update_message_persists_invocation_state() {
        let (memory, _dir) = test_memory_system(3).await;
        let mut msg = ConversationMessage::assistant(
            "c1",
            "",
            vec![ToolInvocation::new("call-1", "get_weather_information", serde_json::json!({}))],
        );
        memory.append_message(&msg).await.unwrap();

        msg.tool_invocations[0].state = InvocationState::Denied;
        msg.tool_invocations[0].result = Some(serde_json::json!("declined"));
        assert!(memory.update_message(&msg).await.unwrap());

        let history = memory.get_messages("c1").await.unwrap();
        assert_eq!(history[0].tool_invocations[0].state, InvocationState::Denied);

        let ghost = ConversationMessage::user("c1", "never stored");
        assert!(!memory.update_message(&ghost).await.unwrap());
    }
}
