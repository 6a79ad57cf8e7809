use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::{apply_write, Collection, Document, DocumentStore, Query, StoreError, Subscription, Write};

/// In-process store used when no database is configured, and by tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<Collection, BTreeMap<String, Value>>,
    listeners: HashMap<u64, Listener>,
    next_listener: u64,
    detached: u64,
    clock: i64,
}

struct Listener {
    query: Query,
    sender: mpsc::UnboundedSender<Vec<Document>>,
}

impl Inner {
    // Strictly increasing so two commits never share a timestamp.
    fn tick(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        self.clock = now.max(self.clock + 1);
        self.clock
    }

    fn run(&self, query: &Query) -> Vec<Document> {
        let mut docs: Vec<Document> = self
            .collections
            .get(&query.collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, data)| query.matches(data))
                    .map(|(id, data)| Document {
                        id: id.clone(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        query.arrange(&mut docs);
        docs
    }

    fn notify(&mut self, touched: &HashSet<Collection>) {
        let mut closed = Vec::new();
        for (id, listener) in &self.listeners {
            if !touched.contains(&listener.query.collection) {
                continue;
            }
            let snapshot = self.run(&listener.query);
            if listener.sender.send(snapshot).is_err() {
                closed.push(*id);
            }
        }
        for id in closed {
            self.listeners.remove(&id);
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of attached live queries.
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Number of live queries detached so far.
    pub fn detached_count(&self) -> u64 {
        self.lock().detached
    }

    pub fn document_count(&self, collection: Collection) -> usize {
        self.lock()
            .collections
            .get(&collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

fn detach_listener(inner: &Weak<Mutex<Inner>>, id: u64) {
    if let Some(inner) = inner.upgrade() {
        let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.listeners.remove(&id).is_some() {
            inner.detached += 1;
            debug!("Detached live query {}", id);
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .collections
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .map(|data| Document {
                id: id.to_string(),
                data: data.clone(),
            }))
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        Ok(self.lock().run(query))
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let now = inner.tick();

        let touched: HashSet<Collection> = writes.iter().map(Write::collection).collect();
        let mut staged: HashMap<Collection, BTreeMap<String, Value>> = touched
            .iter()
            .map(|c| (*c, inner.collections.get(c).cloned().unwrap_or_default()))
            .collect();

        for write in &writes {
            let docs = staged.entry(write.collection()).or_default();
            match apply_write(docs.get(write.id()), write, now)? {
                Some(data) => {
                    docs.insert(write.id().to_string(), data);
                }
                None => {
                    docs.remove(write.id());
                }
            }
        }

        inner.collections.extend(staged);
        debug!("Committed {} writes at {}", writes.len(), now);
        inner.notify(&touched);
        Ok(())
    }

    async fn subscribe(&self, query: Query) -> Result<Subscription, StoreError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let id = inner.next_listener;
        inner.next_listener += 1;

        let _ = sender.send(inner.run(&query));
        debug!("Attached live query {} on {}", id, query.collection);
        inner.listeners.insert(id, Listener { query, sender });

        let weak = Arc::downgrade(&self.inner);
        Ok(Subscription::new(receiver, move || detach_listener(&weak, id)))
    }
}
