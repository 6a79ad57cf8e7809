use std::sync::Arc;

use actix_web::{delete, get, patch, post, web, HttpResponse};
use tracing::{info, warn};

use crate::context::WorkspaceScope;
use crate::email::Email;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthenticatedUser;
use crate::models::invite::WorkspaceInvite;
use crate::models::member::{MemberRole, WorkspaceMember};
use crate::models::workspace::{validate_slug, CreateWorkspace, UpdateWorkspace, Workspace};
use crate::routes::Ack;
use crate::types::{AcceptedInvite, AddMemberRequest, InviteRequest, SlugAvailability, SlugQuery};
use crate::AppState;

#[get("")]
async fn list_workspaces(
    app_state: web::Data<Arc<AppState>>,
    authenticated_user: AuthenticatedUser,
) -> AppResult<web::Json<Vec<Workspace>>> {
    let workspaces = Workspace::list_for_user(app_state.store.as_ref(), &authenticated_user.user_id).await?;
    Ok(web::Json(workspaces))
}

#[post("")]
async fn create_workspace(
    app_state: web::Data<Arc<AppState>>,
    authenticated_user: AuthenticatedUser,
    web::Json(data): web::Json<CreateWorkspace>,
) -> AppResult<HttpResponse> {
    if !authenticated_user.email_verified {
        return Err(AppError::Forbidden(
            "Verify your email before creating a workspace".to_string(),
        ));
    }

    let workspace = Workspace::create(
        app_state.store.as_ref(),
        &authenticated_user.user_id,
        &authenticated_user.email,
        &authenticated_user.display_name(),
        data,
    )
    .await?;
    app_state
        .sessions
        .activate(&authenticated_user.user_id, &workspace.id)
        .await;
    Ok(HttpResponse::Created().json(workspace))
}

#[get("/check-url")]
async fn check_url(
    app_state: web::Data<Arc<AppState>>,
    _authenticated_user: AuthenticatedUser,
    query: web::Query<SlugQuery>,
) -> AppResult<web::Json<SlugAvailability>> {
    let url = query.into_inner().url.trim().to_string();
    validate_slug(&url)?;
    let available = !Workspace::slug_exists(app_state.store.as_ref(), &url).await?;
    Ok(web::Json(SlugAvailability { url, available }))
}

#[post("/invites/{token}/accept")]
pub async fn accept_invite(
    app_state: web::Data<Arc<AppState>>,
    authenticated_user: AuthenticatedUser,
    token: web::Path<String>,
) -> AppResult<web::Json<AcceptedInvite>> {
    let workspace_id = WorkspaceInvite::accept(
        app_state.store.as_ref(),
        &token.into_inner(),
        &authenticated_user.user_id,
        &authenticated_user.email,
        &authenticated_user.display_name(),
    )
    .await?;
    app_state
        .sessions
        .activate(&authenticated_user.user_id, &workspace_id)
        .await;
    Ok(web::Json(AcceptedInvite { workspace_id }))
}

#[get("")]
async fn get_workspace(scope: WorkspaceScope) -> web::Json<Workspace> {
    web::Json(scope.workspace)
}

#[patch("")]
async fn update_workspace(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    web::Json(data): web::Json<UpdateWorkspace>,
) -> AppResult<web::Json<Workspace>> {
    scope.require_manager()?;
    let old_slug = scope.workspace.url.clone();
    let workspace = Workspace::update(app_state.store.as_ref(), scope.id(), data).await?;
    if workspace.url != old_slug {
        app_state.workspace_cache.forget(&old_slug).await;
    }
    Ok(web::Json(workspace))
}

#[delete("")]
async fn delete_workspace(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
) -> AppResult<HttpResponse> {
    if scope.member.role != MemberRole::Owner {
        return Err(AppError::Forbidden(
            "Only the owner can delete a workspace".to_string(),
        ));
    }
    Workspace::delete(app_state.store.as_ref(), scope.id()).await?;
    app_state.workspace_cache.forget(&scope.workspace.url).await;
    app_state.sessions.clear(&scope.user.user_id).await;
    info!("Workspace {} deleted by {}", scope.id(), scope.user.user_id);
    Ok(HttpResponse::Ok().json(Ack::message("Workspace deleted")))
}

#[get("/members")]
async fn list_members(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
) -> AppResult<web::Json<Vec<WorkspaceMember>>> {
    Ok(web::Json(WorkspaceMember::list(app_state.store.as_ref(), scope.id()).await?))
}

#[post("/members")]
async fn add_member(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    web::Json(data): web::Json<AddMemberRequest>,
) -> AppResult<HttpResponse> {
    scope.require_manager()?;
    let display_name = data
        .display_name
        .unwrap_or_else(|| data.email.split('@').next().unwrap_or_default().to_string());
    let member = WorkspaceMember::add(
        app_state.store.as_ref(),
        scope.id(),
        &data.user_id,
        data.role,
        &data.email,
        &display_name,
    )
    .await?;
    Ok(HttpResponse::Created().json(member))
}

#[delete("/members/{user_id}")]
async fn remove_member(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
) -> AppResult<HttpResponse> {
    let (_, user_id) = path.into_inner();
    if user_id != scope.user.user_id {
        scope.require_manager()?;
    }
    WorkspaceMember::remove(app_state.store.as_ref(), scope.id(), &user_id).await?;
    Ok(HttpResponse::Ok().json(Ack::ok()))
}

#[get("/invites")]
async fn list_invites(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
) -> AppResult<web::Json<Vec<WorkspaceInvite>>> {
    scope.require_manager()?;
    Ok(web::Json(WorkspaceInvite::list(app_state.store.as_ref(), scope.id()).await?))
}

#[post("/invites")]
async fn create_invite(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    web::Json(data): web::Json<InviteRequest>,
) -> AppResult<HttpResponse> {
    scope.require_manager()?;
    let invite = WorkspaceInvite::create(
        app_state.store.as_ref(),
        scope.id(),
        &data.email,
        data.role,
        &scope.user.user_id,
    )
    .await?;

    let email = Email::TeamInvite {
        email: invite.email.clone(),
        inviter_name: scope.user.display_name(),
        workspace_name: scope.workspace.name.clone(),
        invite_link: format!("{}/invite/{}", app_state.config.dashboard_url, invite.token),
    };
    if !app_state.notifier.send(email).await {
        warn!("Invite {} created but the email was not sent", invite.id);
    }

    Ok(HttpResponse::Created().json(invite))
}

#[delete("/invites/{invite_id}")]
async fn revoke_invite(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
) -> AppResult<HttpResponse> {
    scope.require_manager()?;
    let (_, invite_id) = path.into_inner();
    WorkspaceInvite::revoke(app_state.store.as_ref(), scope.id(), &invite_id).await?;
    Ok(HttpResponse::Ok().json(Ack::ok()))
}

pub fn configure_root(cfg: &mut web::ServiceConfig) {
    cfg.service(list_workspaces)
        .service(create_workspace)
        .service(check_url);
}

pub fn configure_scoped(cfg: &mut web::ServiceConfig) {
    cfg.service(get_workspace)
        .service(update_workspace)
        .service(delete_workspace)
        .service(list_members)
        .service(add_member)
        .service(remove_member)
        .service(list_invites)
        .service(create_invite)
        .service(revoke_invite);
}
