use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::conversation::Conversation;
use crate::store::{self, encode, Collection, Direction, DocumentStore, Patch, Query, Write};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Customer,
    Business,
    Ai,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub id: String,
    pub conversation_id: String,
    pub text: String,
    pub sender: Sender,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub created_at: i64,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub text: String,
    pub sender: Sender,
    #[serde(default)]
    pub sender_name: Option<String>,
}

impl Default for Message {
    fn default() -> Self {
        Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: String::new(),
            text: String::new(),
            sender: Sender::Customer,
            sender_name: String::new(),
            created_at: 0,
        }
    }
}

impl Message {
    pub fn new(conversation_id: &str, data: NewMessage) -> Self {
        let sender_name = data.sender_name.unwrap_or_else(|| {
            match data.sender {
                Sender::Customer => "Customer",
                Sender::Business => "Support",
                Sender::Ai => "AI Assistant",
            }
            .to_string()
        });
        Message {
            conversation_id: conversation_id.to_string(),
            text: data.text,
            sender: data.sender,
            sender_name,
            ..Default::default()
        }
    }

    /// Messages of one conversation, oldest first.
    pub fn thread_query(conversation_id: &str) -> Query {
        Query::new(Collection::Messages)
            .filter("conversationId", conversation_id)
            .order_by("createdAt", Direction::Asc)
    }

    pub async fn list(store: &dyn DocumentStore, conversation_id: &str) -> AppResult<Vec<Self>> {
        Ok(store::fetch_all(store, &Self::thread_query(conversation_id)).await?)
    }

    /// Appends the message and updates the conversation summary and agent
    /// stats in one batch. Customer messages bump the unread count.
    pub async fn send(store: &dyn DocumentStore, conversation: &Conversation, data: NewMessage) -> AppResult<Self> {
        let text = data.text.trim().to_string();
        if text.is_empty() {
            return Err(AppError::Validation("Message text is required".to_string()));
        }

        let message = Message::new(&conversation.id, NewMessage { text, ..data });

        let mut summary = Patch::new()
            .set("lastMessage", message.text.as_str())
            .server_timestamp("lastMessageAt");
        if message.sender == Sender::Customer {
            summary = summary.increment("unreadCount", 1);
        }

        store
            .commit(vec![
                Write::create(Collection::Messages, &message.id, encode(&message)?),
                Write::update(Collection::Conversations, &conversation.id, summary),
                Write::update(
                    Collection::Agents,
                    &conversation.agent_id,
                    Patch::new()
                        .increment("stats.totalMessages", 1)
                        .server_timestamp("stats.lastActiveAt"),
                ),
            ])
            .await?;
        debug!("Message {} appended to conversation {}", message.id, conversation.id);

        store::fetch(store, Collection::Messages, &message.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("message {}", message.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::agent::{Agent, CreateAgent};
    use crate::models::conversation::NewConversation;
    use crate::store::MemoryStore;

    async fn conversation(store: &MemoryStore) -> Conversation {
        let agent = Agent::create(
            store,
            "w1",
            CreateAgent {
                name: "Support".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        Conversation::create(store, &agent, NewConversation::default()).await.unwrap()
    }

    fn text(text: &str, sender: Sender) -> NewMessage {
        NewMessage {
            text: text.into(),
            sender,
            sender_name: None,
        }
    }

    #[tokio::test]
    async fn send_updates_summary_atomically() {
        let store = MemoryStore::new();
        let conv = conversation(&store).await;

        let sent = Message::send(&store, &conv, text("Where is my order?", Sender::Customer))
            .await
            .unwrap();
        assert_eq!(sent.sender_name, "Customer");

        let after = Conversation::get(&store, &conv.id).await.unwrap().unwrap();
        assert_eq!(after.last_message.as_deref(), Some("Where is my order?"));
        assert_eq!(after.unread_count, 1);
        assert_eq!(after.last_message_at, sent.created_at);
        assert!(after.last_message_at > conv.last_message_at);

        Message::send(&store, &conv, text("On its way", Sender::Business)).await.unwrap();
        let after = Conversation::get(&store, &conv.id).await.unwrap().unwrap();
        assert_eq!(after.unread_count, 1);

        let agent = Agent::get(&store, &conv.agent_id).await.unwrap().unwrap();
        assert_eq!(agent.stats.total_messages, 2);
    }

    #[tokio::test]
    async fn thread_is_chronological() {
        let store = MemoryStore::new();
        let conv = conversation(&store).await;
        for (body, sender) in [("a", Sender::Customer), ("b", Sender::Ai), ("c", Sender::Business)] {
            Message::send(&store, &conv, text(body, sender)).await.unwrap();
        }
        let texts: Vec<_> = Message::list(&store, &conv.id).await.unwrap().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn blank_message_is_rejected_without_writes() {
        let store = MemoryStore::new();
        let conv = conversation(&store).await;
        let err = Message::send(&store, &conv, text("   ", Sender::Customer)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(store.document_count(Collection::Messages), 0);
    }

    #[tokio::test]
    async fn send_to_deleted_conversation_writes_nothing() {
        let store = MemoryStore::new();
        let conv = conversation(&store).await;
        Conversation::delete(&store, &conv.agent_id, &conv.id).await.unwrap();

        let result = Message::send(&store, &conv, text("late", Sender::Customer)).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
        assert_eq!(store.document_count(Collection::Messages), 0);
    }
}
