//! Document persistence with live queries.
//!
//! Every record in the dashboard is a JSON document addressed by
//! `(collection, id)`. The store owns `createdAt`/`updatedAt` and any
//! field requested as a server timestamp, so clients never supply their
//! own clocks. Batched writes are atomic: either every write in a
//! [`commit`](DocumentStore::commit) lands or none does.

pub mod memory;
pub mod postgres;

use std::cmp::Ordering;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CREATED_AT: &str = "createdAt";
pub const UPDATED_AT: &str = "updatedAt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Workspaces,
    WorkspaceSlugs,
    WorkspaceMembers,
    WorkspaceInvites,
    Agents,
    AgentChannels,
    Conversations,
    Messages,
    KnowledgeBase,
    VectorDeletions,
    ReviewForms,
    ReviewSubmissions,
    AgentActions,
    LeadSubmissions,
}

impl Collection {
    pub const ALL: [Collection; 14] = [
        Collection::Workspaces,
        Collection::WorkspaceSlugs,
        Collection::WorkspaceMembers,
        Collection::WorkspaceInvites,
        Collection::Agents,
        Collection::AgentChannels,
        Collection::Conversations,
        Collection::Messages,
        Collection::KnowledgeBase,
        Collection::VectorDeletions,
        Collection::ReviewForms,
        Collection::ReviewSubmissions,
        Collection::AgentActions,
        Collection::LeadSubmissions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Workspaces => "workspaces",
            Collection::WorkspaceSlugs => "workspace_slugs",
            Collection::WorkspaceMembers => "workspace_members",
            Collection::WorkspaceInvites => "workspace_invites",
            Collection::Agents => "agents",
            Collection::AgentChannels => "agentChannels",
            Collection::Conversations => "conversations",
            Collection::Messages => "messages",
            Collection::KnowledgeBase => "knowledgeBase",
            Collection::VectorDeletions => "vector_deletions",
            Collection::ReviewForms => "reviewForms",
            Collection::ReviewSubmissions => "reviewSubmissions",
            Collection::AgentActions => "agentActions",
            Collection::LeadSubmissions => "collectLeadsSubmissions",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Collection::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{collection}/{id} not found")]
    NotFound { collection: Collection, id: String },
    #[error("{collection}/{id} already exists")]
    AlreadyExists { collection: Collection, id: String },
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A stored document. `data` always contains the server timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

impl Document {
    /// Decodes into a typed model, exposing the document id as `id`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        let mut data = self.data.clone();
        if let Value::Object(map) = &mut data {
            map.insert("id".to_string(), Value::String(self.id.clone()));
        }
        Ok(serde_json::from_value(data)?)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// Serializes a model into document data. The id and the server-owned
/// timestamps are stripped; the store assigns them.
pub fn encode<T: Serialize>(value: &T) -> Result<Value, StoreError> {
    let mut data = serde_json::to_value(value)?;
    match &mut data {
        Value::Object(map) => {
            map.remove("id");
            map.remove(CREATED_AT);
            map.remove(UPDATED_AT);
        }
        _ => {
            return Err(StoreError::InvalidDocument(
                "document data must be a JSON object".to_string(),
            ))
        }
    }
    Ok(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Equality filters plus an optional single-field ordering and limit.
#[derive(Debug, Clone)]
pub struct Query {
    pub collection: Collection,
    pub filters: Vec<(String, Value)>,
    pub order: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(collection: Collection) -> Self {
        Query {
            collection,
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn filter(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push((field.to_string(), value.into()));
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order = Some((field.to_string(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, data: &Value) -> bool {
        self.filters
            .iter()
            .all(|(field, expected)| data.get(field) == Some(expected))
    }

    /// Sorts and truncates already-filtered documents. Documents missing
    /// the order field sort last in either direction; ties go by id.
    pub fn arrange(&self, docs: &mut Vec<Document>) {
        match &self.order {
            Some((field, direction)) => docs.sort_by(|a, b| {
                let ordering = match (a.field(field), b.field(field)) {
                    (Some(x), Some(y)) => {
                        let ord = compare_values(x, y);
                        match direction {
                            Direction::Asc => ord,
                            Direction::Desc => ord.reverse(),
                        }
                    }
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                ordering.then_with(|| a.id.cmp(&b.id))
            }),
            None => docs.sort_by(|a, b| a.id.cmp(&b.id)),
        }
        if let Some(limit) = self.limit {
            docs.truncate(limit);
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or_default();
            let y = y.as_f64().unwrap_or_default();
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// Field-level modification applied by [`Write::Update`].
#[derive(Debug, Clone, Default)]
pub struct Patch {
    pub set: Map<String, Value>,
    pub remove: Vec<String>,
    pub increments: Vec<(String, i64)>,
    pub server_timestamps: Vec<String>,
}

impl Patch {
    pub fn new() -> Self {
        Patch::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set.insert(field.to_string(), value.into());
        self
    }

    /// Sets the field only when a value is present.
    pub fn set_opt<V: Into<Value>>(self, field: &str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.set(field, value),
            None => self,
        }
    }

    pub fn remove(mut self, field: &str) -> Self {
        self.remove.push(field.to_string());
        self
    }

    pub fn increment(mut self, field: &str, by: i64) -> Self {
        self.increments.push((field.to_string(), by));
        self
    }

    pub fn server_timestamp(mut self, field: &str) -> Self {
        self.server_timestamps.push(field.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
            && self.remove.is_empty()
            && self.increments.is_empty()
            && self.server_timestamps.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum Write {
    /// Fails with [`StoreError::AlreadyExists`] if the id is taken.
    Create {
        collection: Collection,
        id: String,
        data: Value,
        server_timestamps: Vec<String>,
    },
    /// Upsert. An existing `createdAt` is preserved.
    Set {
        collection: Collection,
        id: String,
        data: Value,
        server_timestamps: Vec<String>,
    },
    /// Fails with [`StoreError::NotFound`] if the document is missing.
    Update {
        collection: Collection,
        id: String,
        patch: Patch,
    },
    Delete {
        collection: Collection,
        id: String,
    },
}

impl Write {
    pub fn create(collection: Collection, id: &str, data: Value) -> Self {
        Write::Create {
            collection,
            id: id.to_string(),
            data,
            server_timestamps: Vec::new(),
        }
    }

    pub fn set(collection: Collection, id: &str, data: Value) -> Self {
        Write::Set {
            collection,
            id: id.to_string(),
            data,
            server_timestamps: Vec::new(),
        }
    }

    pub fn update(collection: Collection, id: &str, patch: Patch) -> Self {
        Write::Update {
            collection,
            id: id.to_string(),
            patch,
        }
    }

    pub fn delete(collection: Collection, id: &str) -> Self {
        Write::Delete {
            collection,
            id: id.to_string(),
        }
    }

    /// Marks an extra field to be filled with the commit timestamp.
    pub fn with_server_timestamp(mut self, field: &str) -> Self {
        match &mut self {
            Write::Create {
                server_timestamps, ..
            }
            | Write::Set {
                server_timestamps, ..
            } => server_timestamps.push(field.to_string()),
            Write::Update { patch, .. } => patch.server_timestamps.push(field.to_string()),
            Write::Delete { .. } => {}
        }
        self
    }

    pub fn collection(&self) -> Collection {
        match self {
            Write::Create { collection, .. }
            | Write::Set { collection, .. }
            | Write::Update { collection, .. }
            | Write::Delete { collection, .. } => *collection,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Write::Create { id, .. }
            | Write::Set { id, .. }
            | Write::Update { id, .. }
            | Write::Delete { id, .. } => id,
        }
    }
}

/// Computes the post-write state of one document. `None` means deleted.
/// Shared by every store implementation so write semantics stay identical.
pub(crate) fn apply_write(
    existing: Option<&Value>,
    write: &Write,
    now: i64,
) -> Result<Option<Value>, StoreError> {
    match write {
        Write::Create {
            collection,
            id,
            data,
            server_timestamps,
        } => {
            if existing.is_some() {
                return Err(StoreError::AlreadyExists {
                    collection: *collection,
                    id: id.clone(),
                });
            }
            let mut map = as_object(data)?;
            map.insert(CREATED_AT.to_string(), Value::from(now));
            map.insert(UPDATED_AT.to_string(), Value::from(now));
            for field in server_timestamps {
                map.insert(field.clone(), Value::from(now));
            }
            Ok(Some(Value::Object(map)))
        }
        Write::Set {
            data,
            server_timestamps,
            ..
        } => {
            let mut map = as_object(data)?;
            let created_at = existing
                .and_then(|doc| doc.get(CREATED_AT))
                .cloned()
                .unwrap_or_else(|| Value::from(now));
            map.insert(CREATED_AT.to_string(), created_at);
            map.insert(UPDATED_AT.to_string(), Value::from(now));
            for field in server_timestamps {
                map.insert(field.clone(), Value::from(now));
            }
            Ok(Some(Value::Object(map)))
        }
        Write::Update {
            collection,
            id,
            patch,
        } => {
            let current = existing.ok_or_else(|| StoreError::NotFound {
                collection: *collection,
                id: id.clone(),
            })?;
            let mut map = as_object(current)?;
            for (field, value) in &patch.set {
                set_path(&mut map, field, value.clone());
            }
            for field in &patch.remove {
                remove_path(&mut map, field);
            }
            for (field, by) in &patch.increments {
                let base = get_path(&map, field).and_then(Value::as_i64).unwrap_or(0);
                set_path(&mut map, field, Value::from(base + by));
            }
            for field in &patch.server_timestamps {
                set_path(&mut map, field, Value::from(now));
            }
            map.insert(UPDATED_AT.to_string(), Value::from(now));
            Ok(Some(Value::Object(map)))
        }
        Write::Delete { .. } => Ok(None),
    }
}

// Patch fields may be dotted paths into nested objects ("stats.totalMessages").
fn get_path<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = map.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

fn set_path(map: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(child) = child {
                set_path(child, rest, value);
            }
        }
    }
}

fn remove_path(map: &mut Map<String, Value>, path: &str) {
    match path.split_once('.') {
        None => {
            map.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = map.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

fn as_object(value: &Value) -> Result<Map<String, Value>, StoreError> {
    value
        .as_object()
        .cloned()
        .ok_or_else(|| StoreError::InvalidDocument("document data must be a JSON object".into()))
}

/// A live query. Yields the full result set once on attach and again after
/// every commit that touches the queried collection. Detaches exactly once,
/// on [`unsubscribe`](Subscription::unsubscribe) or drop, after which no
/// further snapshot is delivered.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Vec<Document>>,
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<Vec<Document>>,
        detach: impl FnOnce() + Send + 'static,
    ) -> Self {
        Subscription {
            receiver,
            detach: Some(Box::new(detach)),
        }
    }

    pub async fn next_snapshot(&mut self) -> Option<Vec<Document>> {
        if self.detach.is_none() {
            return None;
        }
        self.receiver.recv().await
    }

    pub fn is_active(&self) -> bool {
        self.detach.is_some()
    }

    pub fn unsubscribe(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
            self.receiver.close();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl Stream for Subscription {
    type Item = Vec<Document>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.detach.is_none() {
            return Poll::Ready(None);
        }
        this.receiver.poll_recv(cx)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError>;

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Applies every write atomically.
    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError>;

    async fn subscribe(&self, query: Query) -> Result<Subscription, StoreError>;
}

pub async fn fetch<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: Collection,
    id: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(collection, id).await? {
        Some(doc) => Ok(Some(doc.decode()?)),
        None => Ok(None),
    }
}

pub async fn fetch_all<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    query: &Query,
) -> Result<Vec<T>, StoreError> {
    store
        .query(query)
        .await?
        .iter()
        .map(Document::decode)
        .collect()
}

pub fn decode_all<T: DeserializeOwned>(docs: &[Document]) -> Result<Vec<T>, StoreError> {
    docs.iter().map(Document::decode).collect()
}
