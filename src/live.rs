//! Live views backing the conversations inbox.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::AppResult;
use crate::models::conversation::Conversation;
use crate::models::message::Message;
use crate::store::{decode_all, DocumentStore, Query, Subscription};

/// A typed live query: every snapshot is decoded into `T`.
pub struct LiveQuery<T> {
    subscription: Subscription,
    _kind: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> LiveQuery<T> {
    pub async fn open(store: &dyn DocumentStore, query: Query) -> AppResult<Self> {
        Ok(LiveQuery {
            subscription: store.subscribe(query).await?,
            _kind: PhantomData,
        })
    }

    /// The next result set, or `None` once the query is closed.
    pub async fn next(&mut self) -> Option<AppResult<Vec<T>>> {
        let docs = self.subscription.next_snapshot().await?;
        Some(decode_all(&docs).map_err(Into::into))
    }

    pub fn is_active(&self) -> bool {
        self.subscription.is_active()
    }

    pub fn close(&mut self) {
        self.subscription.unsubscribe();
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InboxEvent {
    #[serde(rename_all = "camelCase")]
    Conversations {
        agent_id: String,
        conversations: Vec<Conversation>,
    },
    #[serde(rename_all = "camelCase")]
    Messages {
        conversation_id: String,
        messages: Vec<Message>,
    },
}

struct Watch<T> {
    key: String,
    query: LiveQuery<T>,
}

/// The inbox screen: the agent's conversation list plus the thread of the
/// selected conversation. Replacing either view closes the old live query
/// first; dropping the inbox closes both.
pub struct Inbox {
    store: Arc<dyn DocumentStore>,
    conversations: Option<Watch<Conversation>>,
    thread: Option<Watch<Message>>,
}

enum Side {
    Conversations(Option<AppResult<Vec<Conversation>>>),
    Thread(Option<AppResult<Vec<Message>>>),
}

impl Inbox {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Inbox {
            store,
            conversations: None,
            thread: None,
        }
    }

    /// Switches the list to `agent_id`. The open thread belongs to the
    /// previous agent, so it is closed as well.
    pub async fn watch_agent(&mut self, agent_id: &str) -> AppResult<()> {
        if self.conversations.as_ref().is_some_and(|w| w.key == agent_id) {
            return Ok(());
        }
        self.close_conversation();
        if let Some(mut old) = self.conversations.take() {
            old.query.close();
        }
        let query = LiveQuery::open(self.store.as_ref(), Conversation::inbox_query(agent_id)).await?;
        debug!("Inbox watching agent {}", agent_id);
        self.conversations = Some(Watch {
            key: agent_id.to_string(),
            query,
        });
        Ok(())
    }

    pub async fn open_conversation(&mut self, conversation_id: &str) -> AppResult<()> {
        if self.thread.as_ref().is_some_and(|w| w.key == conversation_id) {
            return Ok(());
        }
        self.close_conversation();
        let query = LiveQuery::open(self.store.as_ref(), Message::thread_query(conversation_id)).await?;
        debug!("Inbox opened conversation {}", conversation_id);
        self.thread = Some(Watch {
            key: conversation_id.to_string(),
            query,
        });
        Ok(())
    }

    pub fn close_conversation(&mut self) {
        if let Some(mut old) = self.thread.take() {
            old.query.close();
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.conversations.as_ref().map(|w| w.key.as_str())
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.thread.as_ref().map(|w| w.key.as_str())
    }

    /// Waits for whichever view changes next. Returns `None` when nothing
    /// is being watched.
    pub async fn next_event(&mut self) -> Option<AppResult<InboxEvent>> {
        loop {
            let side = match (self.conversations.as_mut(), self.thread.as_mut()) {
                (None, None) => return None,
                (Some(list), None) => Side::Conversations(list.query.next().await),
                (None, Some(thread)) => Side::Thread(thread.query.next().await),
                (Some(list), Some(thread)) => tokio::select! {
                    next = list.query.next() => Side::Conversations(next),
                    next = thread.query.next() => Side::Thread(next),
                },
            };

            match side {
                Side::Conversations(Some(result)) => {
                    let agent_id = self.agent_id().unwrap_or_default().to_string();
                    return Some(result.map(|conversations| InboxEvent::Conversations {
                        agent_id,
                        conversations,
                    }));
                }
                Side::Thread(Some(result)) => {
                    let conversation_id = self.conversation_id().unwrap_or_default().to_string();
                    return Some(result.map(|messages| InboxEvent::Messages {
                        conversation_id,
                        messages,
                    }));
                }
                // A view whose feed ended is dropped and the other one kept.
                Side::Conversations(None) => self.conversations = None,
                Side::Thread(None) => self.thread = None,
            }
        }
    }

    pub fn unmount(&mut self) {
        self.close_conversation();
        if let Some(mut old) = self.conversations.take() {
            old.query.close();
        }
    }
}

impl Drop for Inbox {
    fn drop(&mut self) {
        self.unmount();
    }
}
