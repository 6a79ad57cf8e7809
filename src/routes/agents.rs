use std::sync::Arc;

use actix_web::{delete, get, patch, post, web, HttpResponse};
use serde::Serialize;
use tracing::info;

use crate::context::WorkspaceScope;
use crate::error::AppResult;
use crate::models::agent::{Agent, CreateAgent, UpdateAgent};
use crate::models::knowledge::KnowledgeItem;
use crate::routes::Ack;
use crate::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentDetail {
    #[serde(flatten)]
    agent: Agent,
    knowledge_items: Vec<KnowledgeItem>,
}

#[get("/agents")]
async fn list_agents(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
) -> AppResult<web::Json<Vec<Agent>>> {
    Ok(web::Json(Agent::list(app_state.store.as_ref(), scope.id()).await?))
}

#[post("/agents")]
async fn create_agent(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    web::Json(data): web::Json<CreateAgent>,
) -> AppResult<HttpResponse> {
    let agent = Agent::create(app_state.store.as_ref(), scope.id(), data).await?;
    info!("Agent {} created in {} by {}", agent.id, scope.id(), scope.user.user_id);
    Ok(HttpResponse::Created().json(agent))
}

#[get("/agents/{agent_id}")]
async fn get_agent(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
) -> AppResult<web::Json<AgentDetail>> {
    let (_, agent_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    let knowledge_items = KnowledgeItem::list_for_agent(store, &agent.id).await?;
    Ok(web::Json(AgentDetail {
        agent,
        knowledge_items,
    }))
}

#[patch("/agents/{agent_id}")]
async fn update_agent(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
    web::Json(data): web::Json<UpdateAgent>,
) -> AppResult<web::Json<Agent>> {
    let (_, agent_id) = path.into_inner();
    Ok(web::Json(
        Agent::update(app_state.store.as_ref(), scope.id(), &agent_id, data).await?,
    ))
}

#[post("/agents/{agent_id}/duplicate")]
async fn duplicate_agent(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
) -> AppResult<HttpResponse> {
    let (_, agent_id) = path.into_inner();
    let copy = Agent::duplicate(app_state.store.as_ref(), scope.id(), &agent_id).await?;
    Ok(HttpResponse::Created().json(copy))
}

/// Removes the agent with its widgets, conversations and knowledge. Vector
/// deletes are queued and retried by the reconciler.
#[delete("/agents/{agent_id}")]
async fn delete_agent(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
) -> AppResult<HttpResponse> {
    let (_, agent_id) = path.into_inner();
    let queued = Agent::delete(app_state.store.as_ref(), scope.id(), &agent_id).await?;
    Ok(HttpResponse::Ok().json(Ack::message(format!(
        "Agent deleted, {} knowledge item(s) queued for vector removal",
        queued
    ))))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list_agents)
        .service(create_agent)
        .service(get_agent)
        .service(update_agent)
        .service(duplicate_agent)
        .service(delete_agent);
}
