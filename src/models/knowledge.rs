use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::backend::BackendClient;
use crate::error::{AppError, AppResult};
use crate::storage::BlobStorage;
use crate::store::{self, encode, Collection, Direction, DocumentStore, Patch, Query, StoreError, Write};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeType {
    Faq,
    #[default]
    Text,
    Pdf,
    Website,
    Notion,
    Manual,
}

impl KnowledgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeType::Faq => "faq",
            KnowledgeType::Text => "text",
            KnowledgeType::Pdf => "pdf",
            KnowledgeType::Website => "website",
            KnowledgeType::Notion => "notion",
            KnowledgeType::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeStatus {
    Processing,
    #[default]
    Ready,
    Error,
}

/// Local mirror of content ingested by the AI backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeItem {
    #[serde(default)]
    pub id: String,
    pub agent_id: String,
    pub workspace_id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type")]
    pub kind: KnowledgeType,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub status: KnowledgeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawl_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notion_page_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notion_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_database: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks_created: Option<u64>,
    #[serde(default)]
    pub embedding_provider: String,
    #[serde(default)]
    pub embedding_model: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Default for KnowledgeItem {
    fn default() -> Self {
        KnowledgeItem {
            id: Uuid::new_v4().to_string(),
            agent_id: String::new(),
            workspace_id: String::new(),
            title: String::new(),
            content: String::new(),
            kind: KnowledgeType::Text,
            tags: Vec::new(),
            status: KnowledgeStatus::Ready,
            vector_id: None,
            file_name: None,
            file_size: None,
            file_type: None,
            file_url: None,
            website_url: None,
            total_pages: None,
            crawl_method: None,
            question: None,
            answer: None,
            notion_page_id: None,
            notion_url: None,
            is_database: None,
            chunks_created: None,
            embedding_provider: String::new(),
            embedding_model: String::new(),
            created_at: 0,
            updated_at: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateKnowledgeItem {
    pub title: Option<String>,
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// Result of deleting a knowledge item. The local record is gone in both
/// cases; `VectorPending` means the backend delete is queued for retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    VectorPending(String),
}

impl KnowledgeItem {
    /// The id the backend stores vectors under.
    pub fn vector_reference(&self) -> &str {
        self.vector_id.as_deref().unwrap_or(&self.id)
    }

    pub async fn insert(store: &dyn DocumentStore, item: KnowledgeItem) -> AppResult<Self> {
        store
            .commit(vec![Write::create(Collection::KnowledgeBase, &item.id, encode(&item)?)])
            .await?;
        info!(
            "Knowledge item {} ({}) stored for agent {}",
            item.id,
            item.kind.as_str(),
            item.agent_id
        );
        Self::get(store, &item.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("knowledge item {}", item.id)))
    }

    pub async fn get(store: &dyn DocumentStore, id: &str) -> AppResult<Option<Self>> {
        Ok(store::fetch(store, Collection::KnowledgeBase, id).await?)
    }

    pub async fn get_for_agent(store: &dyn DocumentStore, agent_id: &str, id: &str) -> AppResult<Self> {
        Self::get(store, id)
            .await?
            .filter(|item| item.agent_id == agent_id)
            .ok_or_else(|| AppError::NotFound("Knowledge item".to_string()))
    }

    pub async fn list_for_agent(store: &dyn DocumentStore, agent_id: &str) -> AppResult<Vec<Self>> {
        let start = Instant::now();
        let items: Vec<KnowledgeItem> = store::fetch_all(
            store,
            &Query::new(Collection::KnowledgeBase)
                .filter("agentId", agent_id)
                .order_by("createdAt", Direction::Desc),
        )
        .await?;
        debug!("Loaded {} knowledge items in {:?}", items.len(), start.elapsed());
        Ok(items)
    }

    pub async fn list_for_workspace(store: &dyn DocumentStore, workspace_id: &str) -> AppResult<Vec<Self>> {
        Ok(store::fetch_all(
            store,
            &Query::new(Collection::KnowledgeBase)
                .filter("workspaceId", workspace_id)
                .order_by("createdAt", Direction::Desc),
        )
        .await?)
    }

    /// Edits the local record only; the embedded vectors keep the content
    /// they were ingested with.
    pub async fn update(
        store: &dyn DocumentStore,
        agent_id: &str,
        id: &str,
        data: UpdateKnowledgeItem,
    ) -> AppResult<Self> {
        Self::get_for_agent(store, agent_id, id).await?;

        let mut patch = Patch::new();
        if let Some(title) = data.title {
            let title = title.trim().to_string();
            if title.is_empty() {
                return Err(AppError::Validation("Title cannot be empty".to_string()));
            }
            patch = patch.set("title", title);
        }
        if let Some(content) = data.content {
            patch = patch.set("content", content);
        }
        if let Some(tags) = data.tags {
            let tags: Vec<String> = tags
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            patch = patch.set("tags", tags);
        }

        store
            .commit(vec![Write::update(Collection::KnowledgeBase, id, patch)])
            .await?;
        Self::get_for_agent(store, agent_id, id).await
    }

    /// The local delete plus its outbox entry. Committed together so a
    /// vector entry can never outlive its record unnoticed.
    pub fn deletion_writes(&self) -> Result<Vec<Write>, StoreError> {
        let entry = VectorDeletion::for_item(self);
        Ok(vec![
            Write::delete(Collection::KnowledgeBase, &self.id),
            Write::set(Collection::VectorDeletions, &entry.id, encode(&entry)?),
        ])
    }

    pub async fn delete(
        store: &dyn DocumentStore,
        backend: &BackendClient,
        blobs: Option<&BlobStorage>,
        agent_id: &str,
        id: &str,
    ) -> AppResult<DeleteOutcome> {
        let item = Self::get_for_agent(store, agent_id, id).await?;
        store.commit(item.deletion_writes()?).await?;

        if let (Some(blobs), Some(url)) = (blobs, item.file_url.as_deref()) {
            if let Some(key) = blobs.key_from_url(url) {
                if let Err(e) = blobs.delete(&key).await {
                    warn!("Failed to delete stored file for {}: {}", item.id, e);
                }
            }
        }

        let entry = VectorDeletion::for_item(&item);
        match entry.attempt(store, backend).await {
            Ok(None) => Ok(DeleteOutcome::Deleted),
            Ok(Some(reason)) => Ok(DeleteOutcome::VectorPending(reason)),
            Err(e) => {
                // The record is already gone; the queued entry stays for the reconciler.
                warn!("Outbox bookkeeping for {} failed: {}", item.id, e);
                Ok(DeleteOutcome::VectorPending(e.to_string()))
            }
        }
    }

    /// Removes every item of the agent locally and asks the backend to drop
    /// the agent's vectors in one call. Outbox entries are cleared only when
    /// that call succeeds.
    pub async fn delete_all(
        store: &dyn DocumentStore,
        backend: &BackendClient,
        workspace_id: &str,
        agent_id: &str,
    ) -> AppResult<(usize, DeleteOutcome)> {
        let items = Self::list_for_agent(store, agent_id).await?;
        let mut writes = Vec::with_capacity(items.len() * 2);
        for item in &items {
            writes.extend(item.deletion_writes()?);
        }
        if !writes.is_empty() {
            store.commit(writes).await?;
        }

        match backend.delete_all(workspace_id, agent_id).await {
            Ok(()) => {
                let cleared: Vec<Write> = items
                    .iter()
                    .map(|item| Write::delete(Collection::VectorDeletions, &item.id))
                    .collect();
                if !cleared.is_empty() {
                    store.commit(cleared).await?;
                }
                info!("Deleted {} knowledge items for agent {}", items.len(), agent_id);
                Ok((items.len(), DeleteOutcome::Deleted))
            }
            Err(e) => {
                warn!("Bulk vector delete for agent {} failed, queued: {}", agent_id, e);
                Ok((items.len(), DeleteOutcome::VectorPending(e.to_string())))
            }
        }
    }
}

/// Outbox entry for a vector-store delete that has not been confirmed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VectorDeletion {
    #[serde(default)]
    pub id: String,
    pub item_id: String,
    pub agent_id: String,
    pub workspace_id: String,
    pub vector_id: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub confirmed: usize,
    pub pending: usize,
}

impl VectorDeletion {
    fn for_item(item: &KnowledgeItem) -> Self {
        VectorDeletion {
            id: item.id.clone(),
            item_id: item.id.clone(),
            agent_id: item.agent_id.clone(),
            workspace_id: item.workspace_id.clone(),
            vector_id: item.vector_reference().to_string(),
            attempts: 0,
            last_error: None,
            created_at: 0,
        }
    }

    /// Tries the backend delete once. On success the entry is removed and
    /// `None` returned; on failure the attempt is recorded and the reason
    /// returned.
    pub async fn attempt(&self, store: &dyn DocumentStore, backend: &BackendClient) -> AppResult<Option<String>> {
        match backend.delete_document(&self.vector_id).await {
            Ok(_) => {
                store
                    .commit(vec![Write::delete(Collection::VectorDeletions, &self.id)])
                    .await?;
                Ok(None)
            }
            Err(e) => {
                let reason = e.to_string();
                warn!("Vector delete for {} failed (attempt {}): {}", self.item_id, self.attempts + 1, reason);
                store
                    .commit(vec![Write::update(
                        Collection::VectorDeletions,
                        &self.id,
                        Patch::new()
                            .increment("attempts", 1)
                            .set("lastError", reason.as_str())
                            .server_timestamp("lastAttemptAt"),
                    )])
                    .await?;
                Ok(Some(reason))
            }
        }
    }

    pub async fn pending(store: &dyn DocumentStore, limit: usize) -> AppResult<Vec<Self>> {
        Ok(store::fetch_all(
            store,
            &Query::new(Collection::VectorDeletions)
                .order_by("createdAt", Direction::Asc)
                .limit(limit),
        )
        .await?)
    }

    /// Retries queued deletes, oldest first.
    pub async fn reconcile(
        store: &dyn DocumentStore,
        backend: &BackendClient,
        limit: usize,
    ) -> AppResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for entry in Self::pending(store, limit).await? {
            match entry.attempt(store, backend).await? {
                None => report.confirmed += 1,
                Some(_) => report.pending += 1,
            }
        }
        if report.confirmed + report.pending > 0 {
            info!(
                "Vector deletion reconcile: {} confirmed, {} still pending",
                report.confirmed, report.pending
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn seed(store: &MemoryStore, agent_id: &str) -> KnowledgeItem {
        KnowledgeItem::insert(
            store,
            KnowledgeItem {
                agent_id: agent_id.into(),
                workspace_id: "w1".into(),
                title: "Hours".into(),
                content: "Q: What are your hours?\n\nA: 9-5".into(),
                kind: KnowledgeType::Faq,
                vector_id: Some("vec-1".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn delete_confirms_vector_removal() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/knowledge-base/delete/vec-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true, "deleted_chunks": 3})))
            .expect(1)
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        let backend = BackendClient::new(&server.uri());
        let item = seed(&store, "a1").await;

        let outcome = KnowledgeItem::delete(&store, &backend, None, "a1", &item.id).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted);
        assert_eq!(store.document_count(Collection::KnowledgeBase), 0);
        assert_eq!(store.document_count(Collection::VectorDeletions), 0);
    }

    #[tokio::test]
    async fn failed_vector_delete_is_queued_then_reconciled() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/knowledge-base/delete/vec-1"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({"detail": "qdrant down"})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/knowledge-base/delete/vec-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        let backend = BackendClient::new(&server.uri());
        let item = seed(&store, "a1").await;

        let outcome = KnowledgeItem::delete(&store, &backend, None, "a1", &item.id).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::VectorPending("qdrant down".into()));
        assert!(KnowledgeItem::get(&store, &item.id).await.unwrap().is_none());

        let queued = VectorDeletion::pending(&store, 10).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].attempts, 1);

        let report = VectorDeletion::reconcile(&store, &backend, 10).await.unwrap();
        assert_eq!(report, ReconcileReport { confirmed: 1, pending: 0 });
        assert_eq!(store.document_count(Collection::VectorDeletions), 0);
    }

    /// Rejects batches that only touch the vector-deletion outbox.
    struct OutboxDown(MemoryStore);

    #[async_trait::async_trait]
    impl DocumentStore for OutboxDown {
        async fn get(&self, collection: Collection, id: &str) -> Result<Option<store::Document>, StoreError> {
            self.0.get(collection, id).await
        }

        async fn query(&self, query: &Query) -> Result<Vec<store::Document>, StoreError> {
            self.0.query(query).await
        }

        async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
            if writes.iter().all(|w| w.collection() == Collection::VectorDeletions) {
                return Err(StoreError::InvalidDocument("outbox unavailable".into()));
            }
            self.0.commit(writes).await
        }

        async fn subscribe(&self, query: Query) -> Result<store::Subscription, StoreError> {
            self.0.subscribe(query).await
        }
    }

    #[tokio::test]
    async fn outbox_failure_after_local_delete_is_pending() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/knowledge-base/delete/vec-1"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({"detail": "qdrant down"})))
            .mount(&server)
            .await;

        let inner = MemoryStore::new();
        let item = seed(&inner, "a1").await;
        let store = OutboxDown(inner);
        let backend = BackendClient::new(&server.uri());

        let outcome = KnowledgeItem::delete(&store, &backend, None, "a1", &item.id).await.unwrap();
        assert!(matches!(outcome, DeleteOutcome::VectorPending(_)));
        assert_eq!(store.0.document_count(Collection::KnowledgeBase), 0);
        assert_eq!(store.0.document_count(Collection::VectorDeletions), 1);
    }

    #[tokio::test]
    async fn delete_of_other_agents_item_is_not_found() {
        let store = MemoryStore::new();
        let backend = BackendClient::new("http://127.0.0.1:9");
        let item = seed(&store, "a1").await;
        let err = KnowledgeItem::delete(&store, &backend, None, "a2", &item.id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(store.document_count(Collection::KnowledgeBase), 1);
    }

    #[tokio::test]
    async fn update_trims_tags() {
        let store = MemoryStore::new();
        let item = seed(&store, "a1").await;
        let updated = KnowledgeItem::update(
            &store,
            "a1",
            &item.id,
            UpdateKnowledgeItem {
                tags: Some(vec![" hours ".into(), "".into()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.tags, vec!["hours"]);
        assert_eq!(updated.title, "Hours");
    }
}
