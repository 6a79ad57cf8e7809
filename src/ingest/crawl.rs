//! Website crawl preview and the batched commit of (possibly edited) chunks.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info};
use utoipa::ToSchema;

use crate::backend::{BackendClient, BatchInfo, Chunk, CrawlPreview, CrawlRequest, SaveChunksRequest};
use crate::error::{AppError, AppResult};
use crate::ingest::{base_item, InFlightGuard};
use crate::models::agent::Agent;
use crate::models::knowledge::{KnowledgeItem, KnowledgeType};
use crate::AppState;

pub const CHUNK_BATCH_SIZE: usize = 50;
pub const MAX_PAGES: u32 = 100;
pub const MAX_DEPTH: u32 = 3;

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CrawlTarget {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default)]
    pub is_sitemap: bool,
}

fn default_max_pages() -> u32 {
    MAX_PAGES
}

/// What the client sends back after reviewing the preview.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub crawl_method: String,
    #[serde(default)]
    pub total_pages: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[schema(value_type = Vec<Object>)]
    pub chunks: Vec<Chunk>,
}

impl CommitRequest {
    pub fn from_preview(title: String, preview: CrawlPreview) -> Self {
        CommitRequest {
            url: preview.url,
            title,
            crawl_method: preview.crawl_method,
            total_pages: preview.total_pages,
            tags: Vec::new(),
            chunks: preview.chunks,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub committed: usize,
    pub total: usize,
    pub batch: usize,
    pub total_batches: usize,
}

/// One line of the streamed commit response.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum CommitEvent {
    Progress(Progress),
    #[serde(rename_all = "camelCase")]
    Done { item: KnowledgeItem, chunks_saved: u64 },
    #[serde(rename_all = "camelCase")]
    Failed {
        error: String,
        failed_batch: Option<usize>,
        committed: usize,
        total: usize,
    },
}

pub async fn preview(
    backend: &BackendClient,
    agent: &Agent,
    target: &CrawlTarget,
) -> AppResult<CrawlPreview> {
    let url = target.url.trim();
    if url.is_empty() {
        return Err(AppError::Validation("Please enter a website URL".to_string()));
    }

    let preview = backend
        .crawl_preview(&CrawlRequest {
            url: url.to_string(),
            widget_id: agent.id.clone(),
            title: target.title.clone(),
            max_pages: target.max_pages.clamp(1, MAX_PAGES),
            max_depth: MAX_DEPTH,
            is_sitemap: target.is_sitemap,
            metadata: json!({ "business_id": agent.workspace_id }),
        })
        .await?;
    info!(
        "Crawled {} via {}: {} pages, {} chunks",
        preview.url,
        preview.crawl_method,
        preview.total_pages,
        preview.chunks.len()
    );
    Ok(preview)
}

/// Slices `total` chunks into consecutive batches of at most
/// [`CHUNK_BATCH_SIZE`].
pub fn plan(total: usize) -> Vec<(std::ops::Range<usize>, BatchInfo)> {
    let total_batches = total.div_ceil(CHUNK_BATCH_SIZE);
    (0..total)
        .step_by(CHUNK_BATCH_SIZE)
        .map(|start| {
            let end = (start + CHUNK_BATCH_SIZE).min(total);
            (
                start..end,
                BatchInfo {
                    batch_num: start / CHUNK_BATCH_SIZE + 1,
                    total_batches,
                    is_first_batch: start == 0,
                    is_last_batch: start + CHUNK_BATCH_SIZE >= total,
                },
            )
        })
        .collect()
}

/// Sends the chunks batch by batch, reporting cumulative progress after
/// each. A failed batch stops the commit; earlier batches stay saved.
/// Returns the number of chunks the backend stored.
pub async fn commit_chunks<F>(
    backend: &BackendClient,
    agent: &Agent,
    commit: &CommitRequest,
    mut on_progress: F,
) -> AppResult<u64>
where
    F: FnMut(Progress),
{
    let total = commit.chunks.len();
    if total == 0 {
        return Err(AppError::Validation("There are no chunks to save".to_string()));
    }

    let mut saved = 0;
    for (range, batch_info) in plan(total) {
        let committed = range.start;
        let request = SaveChunksRequest {
            widget_id: &agent.id,
            title: &commit.title,
            url: &commit.url,
            crawl_method: &commit.crawl_method,
            chunks: &commit.chunks[range.clone()],
            batch_info,
            metadata: json!({ "business_id": agent.workspace_id }),
        };

        match backend.save_chunks(&request).await {
            Ok(created) => saved += created,
            Err(e) => {
                error!(
                    "Batch {}/{} for {} failed: {}",
                    batch_info.batch_num, batch_info.total_batches, commit.url, e
                );
                return Err(AppError::PartialCommit {
                    failed_batch: batch_info.batch_num,
                    committed,
                    total,
                    reason: e.to_string(),
                });
            }
        }

        on_progress(Progress {
            committed: range.end,
            total,
            batch: batch_info.batch_num,
            total_batches: batch_info.total_batches,
        });
    }

    info!("Saved {} chunks from {}", saved, commit.url);
    Ok(saved)
}

/// The local record for a committed crawl.
pub fn website_item(base: KnowledgeItem, commit: &CommitRequest, saved: u64) -> KnowledgeItem {
    KnowledgeItem {
        content: format!(
            "Website crawled: {} ({} pages, {} chunks)",
            commit.url, commit.total_pages, saved
        ),
        website_url: Some(commit.url.clone()),
        total_pages: Some(commit.total_pages),
        crawl_method: Some(commit.crawl_method.clone()).filter(|m| !m.is_empty()),
        chunks_created: Some(saved),
        ..base
    }
}

/// Runs the commit on its own task so it finishes even if the caller stops
/// listening. Events arrive on the returned channel; the in-flight guard is
/// released when the task ends.
pub fn spawn_commit(
    state: Arc<AppState>,
    agent: Agent,
    commit: CommitRequest,
    guard: InFlightGuard,
) -> mpsc::UnboundedReceiver<CommitEvent> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let _guard = guard;
        let progress_tx = tx.clone();
        let result = commit_chunks(&state.backend, &agent, &commit, |progress| {
            let _ = progress_tx.send(CommitEvent::Progress(progress));
        })
        .await;

        let event = match result {
            Ok(saved) => {
                let title = if commit.title.trim().is_empty() {
                    commit.url.clone()
                } else {
                    commit.title.trim().to_string()
                };
                let base = base_item(&state, &agent, KnowledgeType::Website, &title, commit.tags.clone());
                match KnowledgeItem::insert(state.store.as_ref(), website_item(base, &commit, saved)).await {
                    Ok(item) => CommitEvent::Done {
                        item,
                        chunks_saved: saved,
                    },
                    Err(e) => CommitEvent::Failed {
                        error: e.to_string(),
                        failed_batch: None,
                        committed: commit.chunks.len(),
                        total: commit.chunks.len(),
                    },
                }
            }
            Err(AppError::PartialCommit {
                failed_batch,
                committed,
                total,
                reason,
            }) => CommitEvent::Failed {
                error: reason,
                failed_batch: Some(failed_batch),
                committed,
                total,
            },
            Err(e) => CommitEvent::Failed {
                error: e.to_string(),
                failed_batch: None,
                committed: 0,
                total: commit.chunks.len(),
            },
        };
        let _ = tx.send(event);
    });

    rx
}
