use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::agent::Agent;
use crate::models::message::{Message, NewMessage, Sender};
use crate::store::{self, encode, Collection, Direction, DocumentStore, Patch, Query, StoreError, Write};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Active,
    Pending,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(default)]
    pub id: String,
    pub agent_id: String,
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget_id: Option<String>,
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub customer_email: String,
    #[serde(default)]
    pub status: ConversationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_at: i64,
    #[serde(default)]
    pub unread_count: u64,
    #[serde(default)]
    pub handover_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handover_reason: Option<String>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Default for Conversation {
    fn default() -> Self {
        Conversation {
            id: Uuid::new_v4().to_string(),
            agent_id: String::new(),
            workspace_id: String::new(),
            widget_id: None,
            customer_name: String::new(),
            customer_email: String::new(),
            status: ConversationStatus::Active,
            last_message: None,
            last_message_at: 0,
            unread_count: 0,
            handover_requested: false,
            handover_reason: None,
            created_at: 0,
            updated_at: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewConversation {
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub customer_email: String,
    #[serde(default)]
    pub widget_id: Option<String>,
    #[serde(default)]
    pub initial_message: Option<String>,
}

impl Conversation {
    /// Conversations of an agent, most recently active first.
    pub fn inbox_query(agent_id: &str) -> Query {
        Query::new(Collection::Conversations)
            .filter("agentId", agent_id)
            .order_by("lastMessageAt", Direction::Desc)
    }

    /// Creates the conversation with `lastMessageAt` stamped at creation so
    /// it sorts into the inbox immediately. An initial customer message is
    /// written in the same batch.
    pub async fn create(store: &dyn DocumentStore, agent: &Agent, data: NewConversation) -> AppResult<Self> {
        let customer_name = Some(data.customer_name.trim())
            .filter(|n| !n.is_empty())
            .unwrap_or("Anonymous")
            .to_string();

        let mut conversation = Conversation {
            agent_id: agent.id.clone(),
            workspace_id: agent.workspace_id.clone(),
            widget_id: data.widget_id,
            customer_name: customer_name.clone(),
            customer_email: data.customer_email.trim().to_lowercase(),
            ..Default::default()
        };

        let mut writes = Vec::new();
        let first = data
            .initial_message
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());
        if let Some(text) = &first {
            conversation.last_message = Some(text.clone());
            conversation.unread_count = 1;
        }
        writes.push(
            Write::create(Collection::Conversations, &conversation.id, encode(&conversation)?)
                .with_server_timestamp("lastMessageAt"),
        );

        let mut agent_patch = Patch::new()
            .increment("stats.totalConversations", 1)
            .server_timestamp("stats.lastActiveAt");
        if let Some(text) = first {
            let message = Message::new(
                &conversation.id,
                NewMessage {
                    text,
                    sender: Sender::Customer,
                    sender_name: Some(customer_name),
                },
            );
            writes.push(Write::create(Collection::Messages, &message.id, encode(&message)?));
            agent_patch = agent_patch.increment("stats.totalMessages", 1);
        }
        writes.push(Write::update(Collection::Agents, &agent.id, agent_patch));

        store.commit(writes).await?;
        info!("Conversation {} started with agent {}", conversation.id, agent.id);

        Self::get(store, &conversation.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("conversation {}", conversation.id)))
    }

    pub async fn get(store: &dyn DocumentStore, id: &str) -> AppResult<Option<Self>> {
        Ok(store::fetch(store, Collection::Conversations, id).await?)
    }

    pub async fn get_for_agent(store: &dyn DocumentStore, agent_id: &str, id: &str) -> AppResult<Self> {
        Self::get(store, id)
            .await?
            .filter(|c| c.agent_id == agent_id)
            .ok_or_else(|| AppError::NotFound("Conversation".to_string()))
    }

    pub async fn list_for_agent(store: &dyn DocumentStore, agent_id: &str) -> AppResult<Vec<Self>> {
        Ok(store::fetch_all(store, &Self::inbox_query(agent_id)).await?)
    }

    pub async fn count_for_widget(store: &dyn DocumentStore, widget_id: &str) -> AppResult<usize> {
        Ok(store
            .query(&Query::new(Collection::Conversations).filter("widgetId", widget_id))
            .await?
            .len())
    }

    async fn patch(store: &dyn DocumentStore, agent_id: &str, id: &str, patch: Patch) -> AppResult<Self> {
        Self::get_for_agent(store, agent_id, id).await?;
        store
            .commit(vec![Write::update(Collection::Conversations, id, patch)])
            .await?;
        Self::get_for_agent(store, agent_id, id).await
    }

    pub async fn set_status(
        store: &dyn DocumentStore,
        agent_id: &str,
        id: &str,
        status: ConversationStatus,
    ) -> AppResult<Self> {
        let value: Value = serde_json::to_value(status).map_err(StoreError::from)?;
        debug!("Conversation {} -> {:?}", id, status);
        Self::patch(store, agent_id, id, Patch::new().set("status", value)).await
    }

    pub async fn mark_read(store: &dyn DocumentStore, agent_id: &str, id: &str) -> AppResult<Self> {
        Self::patch(store, agent_id, id, Patch::new().set("unreadCount", 0)).await
    }

    /// Flags the conversation for a human. The status moves to pending.
    pub async fn request_handover(
        store: &dyn DocumentStore,
        agent_id: &str,
        id: &str,
        reason: Option<String>,
    ) -> AppResult<Self> {
        let patch = Patch::new()
            .set("handoverRequested", true)
            .set("status", "pending")
            .set_opt("handoverReason", reason)
            .server_timestamp("handoverRequestedAt");
        info!("Handover requested for conversation {}", id);
        Self::patch(store, agent_id, id, patch).await
    }

    pub async fn clear_handover(store: &dyn DocumentStore, agent_id: &str, id: &str) -> AppResult<Self> {
        let patch = Patch::new()
            .set("handoverRequested", false)
            .set("status", "active")
            .remove("handoverReason")
            .remove("handoverRequestedAt");
        Self::patch(store, agent_id, id, patch).await
    }

    async fn message_deletes(store: &dyn DocumentStore, id: &str) -> AppResult<Vec<Write>> {
        Ok(store
            .query(&Query::new(Collection::Messages).filter("conversationId", id))
            .await?
            .iter()
            .map(|doc| Write::delete(Collection::Messages, &doc.id))
            .collect())
    }

    /// Deletes for every message of the conversation, then the
    /// conversation itself.
    pub async fn deletion_writes(store: &dyn DocumentStore, id: &str) -> AppResult<Vec<Write>> {
        let mut writes = Self::message_deletes(store, id).await?;
        writes.push(Write::delete(Collection::Conversations, id));
        Ok(writes)
    }

    pub async fn delete(store: &dyn DocumentStore, agent_id: &str, id: &str) -> AppResult<usize> {
        Self::get_for_agent(store, agent_id, id).await?;
        let writes = Self::deletion_writes(store, id).await?;
        let mut messages = writes.len() - 1;
        store.commit(writes).await?;

        // A send committed between the query and the delete leaves its
        // message behind. Sends after the delete fail on the missing
        // conversation, so one sweep is enough.
        let stragglers = Self::message_deletes(store, id).await?;
        if !stragglers.is_empty() {
            debug!("Sweeping {} late messages of conversation {}", stragglers.len(), id);
            messages += stragglers.len();
            store.commit(stragglers).await?;
        }

        info!("Conversation {} deleted with {} messages", id, messages);
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::agent::CreateAgent;
    use crate::store::MemoryStore;

    async fn agent(store: &MemoryStore) -> Agent {
        Agent::create(
            store,
            "w1",
            CreateAgent {
                name: "Support".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap()
    }

    fn customer(name: &str) -> NewConversation {
        NewConversation {
            customer_name: name.into(),
            customer_email: format!("{}@example.com", name.to_lowercase()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn new_conversation_sorts_into_inbox() {
        let store = MemoryStore::new();
        let agent = agent(&store).await;
        let first = Conversation::create(&store, &agent, customer("Ann")).await.unwrap();
        let second = Conversation::create(&store, &agent, customer("Bob")).await.unwrap();
        assert!(first.last_message_at > 0);

        let ids: Vec<_> = Conversation::list_for_agent(&store, &agent.id)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![second.id, first.id]);

        let agent = Agent::get(&store, &agent.id).await.unwrap().unwrap();
        assert_eq!(agent.stats.total_conversations, 2);
    }

    #[tokio::test]
    async fn initial_message_is_written_with_conversation() {
        let store = MemoryStore::new();
        let agent = agent(&store).await;
        let conversation = Conversation::create(
            &store,
            &agent,
            NewConversation {
                initial_message: Some(" Hi there ".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(conversation.customer_name, "Anonymous");
        assert_eq!(conversation.last_message.as_deref(), Some("Hi there"));
        assert_eq!(conversation.unread_count, 1);
        assert_eq!(Message::list(&store, &conversation.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_leaves_no_messages() {
        let store = MemoryStore::new();
        let agent = agent(&store).await;
        let conversation = Conversation::create(&store, &agent, customer("Ann")).await.unwrap();
        for text in ["one", "two", "three"] {
            Message::send(
                &store,
                &conversation,
                NewMessage {
                    text: text.into(),
                    sender: Sender::Customer,
                    sender_name: None,
                },
            )
            .await
            .unwrap();
        }

        let removed = Conversation::delete(&store, &agent.id, &conversation.id).await.unwrap();
        assert_eq!(removed, 3);
        assert!(Message::list(&store, &conversation.id).await.unwrap().is_empty());
        assert!(Conversation::get(&store, &conversation.id).await.unwrap().is_none());
    }

    /// Lands one customer message right before the first batch that
    /// deletes a conversation, as a concurrent send would.
    struct SendDuringDelete {
        inner: MemoryStore,
        conversation: Conversation,
        fired: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl DocumentStore for SendDuringDelete {
        async fn get(&self, collection: Collection, id: &str) -> Result<Option<store::Document>, StoreError> {
            self.inner.get(collection, id).await
        }

        async fn query(&self, query: &Query) -> Result<Vec<store::Document>, StoreError> {
            self.inner.query(query).await
        }

        async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
            let deletes_conversation = writes
                .iter()
                .any(|w| matches!(w, Write::Delete { collection: Collection::Conversations, .. }));
            if deletes_conversation && !self.fired.swap(true, std::sync::atomic::Ordering::SeqCst) {
                Message::send(
                    &self.inner,
                    &self.conversation,
                    NewMessage {
                        text: "late".into(),
                        sender: Sender::Customer,
                        sender_name: None,
                    },
                )
                .await
                .unwrap();
            }
            self.inner.commit(writes).await
        }

        async fn subscribe(&self, query: Query) -> Result<store::Subscription, StoreError> {
            self.inner.subscribe(query).await
        }
    }

    #[tokio::test]
    async fn delete_sweeps_a_message_sent_mid_delete() {
        let inner = MemoryStore::new();
        let agent = agent(&inner).await;
        let conversation = Conversation::create(&inner, &agent, customer("Ann")).await.unwrap();
        let store = SendDuringDelete {
            inner,
            conversation: conversation.clone(),
            fired: Default::default(),
        };

        let removed = Conversation::delete(&store, &agent.id, &conversation.id).await.unwrap();
        assert_eq!(removed, 1);
        assert!(Message::list(&store, &conversation.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn handover_round_trip() {
        let store = MemoryStore::new();
        let agent = agent(&store).await;
        let conversation = Conversation::create(&store, &agent, customer("Ann")).await.unwrap();

        let flagged = Conversation::request_handover(&store, &agent.id, &conversation.id, Some("angry".into()))
            .await
            .unwrap();
        assert!(flagged.handover_requested);
        assert_eq!(flagged.status, ConversationStatus::Pending);

        let cleared = Conversation::clear_handover(&store, &agent.id, &conversation.id).await.unwrap();
        assert!(!cleared.handover_requested);
        assert_eq!(cleared.handover_reason, None);
        assert_eq!(cleared.status, ConversationStatus::Active);
    }
}
