use std::sync::Arc;

use actix_web::{post, web, Error, HttpResponse};
use bytes::Bytes;
use futures::stream;
use tracing::{error, info};

use crate::backend::CrawlPreview;
use crate::context::WorkspaceScope;
use crate::error::AppResult;
use crate::ingest::crawl::{self, CommitEvent, CommitRequest, CrawlTarget};
use crate::models::agent::Agent;
use crate::AppState;

#[post("/agents/{agent_id}/crawl/preview")]
async fn preview_crawl(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
    web::Json(target): web::Json<CrawlTarget>,
) -> AppResult<web::Json<CrawlPreview>> {
    let (_, agent_id) = path.into_inner();
    let agent = Agent::get_in_workspace(app_state.store.as_ref(), scope.id(), &agent_id).await?;
    let _guard = app_state.in_flight.acquire(&scope.user.user_id, &agent.id)?;
    Ok(web::Json(crawl::preview(&app_state.backend, &agent, &target).await?))
}

/// Saves previewed chunks in batches and streams one JSON line per event:
/// progress after every batch, then `done` or `failed`.
#[post("/agents/{agent_id}/crawl/commit")]
async fn commit_crawl(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
    web::Json(commit): web::Json<CommitRequest>,
) -> AppResult<HttpResponse> {
    let (_, agent_id) = path.into_inner();
    let agent = Agent::get_in_workspace(app_state.store.as_ref(), scope.id(), &agent_id).await?;
    let guard = app_state.in_flight.acquire(&scope.user.user_id, &agent.id)?;

    info!(
        "Committing {} chunks from {} for agent {}",
        commit.chunks.len(),
        commit.url,
        agent.id
    );
    let events = crawl::spawn_commit(app_state.get_ref().clone(), agent, commit, guard);

    let body = stream::unfold(events, |mut events| async move {
        let event = events.recv().await?;
        let line = match serde_json::to_string(&event) {
            Ok(json) => format!("{}\n", json),
            Err(e) => {
                error!("Failed to encode commit event: {}", e);
                return None;
            }
        };
        if let CommitEvent::Failed { error, .. } = &event {
            error!("Website commit failed: {}", error);
        }
        Some((Ok::<Bytes, Error>(Bytes::from(line)), events))
    });

    Ok(HttpResponse::Ok()
        .content_type("application/x-ndjson")
        .streaming(body))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(preview_crawl).service(commit_crawl);
}
