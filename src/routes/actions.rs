use std::sync::Arc;

use actix_web::http::header::USER_AGENT;
use actix_web::{delete, get, patch, post, web, HttpRequest, HttpResponse};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::context::WorkspaceScope;
use crate::email::Email;
use crate::error::AppResult;
use crate::models::action::{
    ActionKind, AgentAction, CreateAction, LeadOrigin, LeadSubmission, SubmitLead, UpdateAction,
};
use crate::models::agent::Agent;
use crate::models::member::WorkspaceMember;
use crate::models::workspace::Workspace;
use crate::routes::Ack;
use crate::AppState;

#[get("/agents/{agent_id}/actions")]
async fn list_actions(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
) -> AppResult<web::Json<Vec<AgentAction>>> {
    let (_, agent_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    Ok(web::Json(AgentAction::list_for_agent(store, &agent.id).await?))
}

#[post("/agents/{agent_id}/actions")]
async fn create_action(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
    web::Json(data): web::Json<CreateAction>,
) -> AppResult<HttpResponse> {
    let (_, agent_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    Ok(HttpResponse::Created().json(AgentAction::create(store, &agent, data).await?))
}

#[get("/agents/{agent_id}/actions/{action_id}")]
async fn get_action(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String, String)>,
) -> AppResult<web::Json<AgentAction>> {
    let (_, agent_id, action_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    Ok(web::Json(AgentAction::get_for_agent(store, &agent.id, &action_id).await?))
}

#[patch("/agents/{agent_id}/actions/{action_id}")]
async fn update_action(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String, String)>,
    web::Json(data): web::Json<UpdateAction>,
) -> AppResult<web::Json<AgentAction>> {
    let (_, agent_id, action_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    Ok(web::Json(
        AgentAction::update(store, &agent.id, &action_id, data).await?,
    ))
}

#[delete("/agents/{agent_id}/actions/{action_id}")]
async fn delete_action(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String, String)>,
) -> AppResult<HttpResponse> {
    let (_, agent_id, action_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    let leads = AgentAction::delete(store, &agent.id, &action_id).await?;
    Ok(HttpResponse::Ok().json(Ack::message(format!("Action deleted with {} leads", leads))))
}

#[get("/agents/{agent_id}/actions/{action_id}/submissions")]
async fn list_action_leads(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String, String)>,
) -> AppResult<web::Json<Vec<LeadSubmission>>> {
    let (_, agent_id, action_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    let action = AgentAction::get_for_agent(store, &agent.id, &action_id).await?;
    Ok(web::Json(LeadSubmission::list_for_action(store, &action.id).await?))
}

#[get("/agents/{agent_id}/leads")]
async fn list_agent_leads(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
) -> AppResult<web::Json<Vec<LeadSubmission>>> {
    let (_, agent_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    Ok(web::Json(LeadSubmission::list_for_agent(store, &agent.id).await?))
}

#[derive(Debug, Deserialize)]
struct ActiveQuery {
    #[serde(rename = "type")]
    kind: Option<ActionKind>,
}

#[get("/agents/{agent_id}/actions")]
async fn active_actions(
    app_state: web::Data<Arc<AppState>>,
    agent_id: web::Path<String>,
    query: web::Query<ActiveQuery>,
) -> AppResult<web::Json<Vec<AgentAction>>> {
    Ok(web::Json(
        AgentAction::active_for_agent(app_state.store.as_ref(), &agent_id, query.kind).await?,
    ))
}

/// The workspace owner's notification for a new lead. `None` when the
/// lead left no email or the owner cannot be found.
async fn lead_email(app_state: &AppState, action: &AgentAction, lead: &LeadSubmission) -> AppResult<Option<Email>> {
    let (lead_name, lead_email) = lead.contact(&action.leads_config()?);
    let Some(lead_email) = lead_email else {
        return Ok(None);
    };

    let store = app_state.store.as_ref();
    let Some(workspace) = Workspace::get(store, &action.workspace_id).await? else {
        return Ok(None);
    };
    let Some(owner) = WorkspaceMember::get(store, &workspace.id, &workspace.owner_id).await? else {
        return Ok(None);
    };

    Ok(Some(Email::LeadCollected {
        email: owner.email,
        user_name: owner.display_name,
        lead_name: lead_name.unwrap_or_else(|| "Anonymous".to_string()),
        lead_email,
        lead_data: lead.data.clone(),
        dashboard_link: format!(
            "{}/dashboard/{}/agents/{}/contacts",
            app_state.config.dashboard_url, workspace.url, action.agent_id
        ),
    }))
}

#[post("/actions/{action_id}/leads")]
async fn submit_lead(
    app_state: web::Data<Arc<AppState>>,
    req: HttpRequest,
    action_id: web::Path<String>,
    web::Json(data): web::Json<SubmitLead>,
) -> AppResult<HttpResponse> {
    let origin = LeadOrigin {
        ip_address: req.connection_info().realip_remote_addr().map(str::to_string),
        user_agent: req
            .headers()
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    };
    let (action, lead) = AgentAction::submit_lead(app_state.store.as_ref(), &action_id, data, origin).await?;

    // The lead is stored; notification problems only get logged.
    match lead_email(&app_state, &action, &lead).await {
        Ok(Some(email)) => {
            let notifier = app_state.notifier.clone();
            actix_web::rt::spawn(async move {
                notifier.send(email).await;
            });
        }
        Ok(None) => debug!("No lead notification for {}", lead.id),
        Err(e) => warn!("Failed to prepare lead notification for {}: {}", lead.id, e),
    }

    Ok(HttpResponse::Created().json(lead))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list_actions)
        .service(create_action)
        .service(get_action)
        .service(update_action)
        .service(delete_action)
        .service(list_action_leads)
        .service(list_agent_leads);
}

pub fn configure_public(cfg: &mut web::ServiceConfig) {
    cfg.service(active_actions).service(submit_lead);
}
