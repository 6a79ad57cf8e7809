//! Per-user session context and the guard in front of every
//! `/w/{workspace}/...` route.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{dev::Payload, web, FromRequest, HttpMessage, HttpRequest};
use futures_util::future::LocalBoxFuture;
use moka::future::Cache;
use serde::Serialize;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthenticatedUser;
use crate::models::member::WorkspaceMember;
use crate::models::workspace::Workspace;
use crate::store::DocumentStore;
use crate::AppState;

/// The active workspace of every signed-in user.
#[derive(Clone)]
pub struct SessionRegistry {
    active: Cache<String, String>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            active: Cache::builder()
                .max_capacity(100_000)
                .time_to_idle(Duration::from_secs(60 * 60 * 24 * 7))
                .build(),
        }
    }

    pub async fn current(&self, user_id: &str) -> Option<String> {
        self.active.get(user_id).await
    }

    pub async fn activate(&self, user_id: &str, workspace_id: &str) {
        if self.current(user_id).await.as_deref() != Some(workspace_id) {
            debug!("User {} switched to workspace {}", user_id, workspace_id);
            self.active
                .insert(user_id.to_string(), workspace_id.to_string())
                .await;
        }
    }

    pub async fn clear(&self, user_id: &str) {
        self.active.remove(user_id).await;
    }
}

/// Workspaces by slug. Entries are re-checked against the slug on read, so
/// a renamed workspace never resolves under its old URL.
#[derive(Clone)]
pub struct WorkspaceCache {
    by_slug: Cache<String, Workspace>,
}

impl Default for WorkspaceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkspaceCache {
    pub fn new() -> Self {
        WorkspaceCache {
            by_slug: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(300))
                .build(),
        }
    }

    pub async fn resolve(&self, store: &dyn DocumentStore, slug: &str) -> AppResult<Option<Workspace>> {
        if let Some(cached) = self.by_slug.get(slug).await {
            if let Some(fresh) = Workspace::get(store, &cached.id).await? {
                if fresh.url == slug {
                    return Ok(Some(fresh));
                }
            }
            debug!("Dropping stale cache entry for /{}", slug);
            self.by_slug.remove(slug).await;
        }

        let workspace = Workspace::get_by_slug(store, slug).await?;
        if let Some(workspace) = &workspace {
            self.by_slug.insert(slug.to_string(), workspace.clone()).await;
        }
        Ok(workspace)
    }

    pub async fn forget(&self, slug: &str) {
        self.by_slug.remove(slug).await;
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub user_id: String,
    pub email: String,
    pub email_verified: bool,
    pub workspace: Option<Workspace>,
    pub workspaces: Vec<Workspace>,
    pub created_workspace: bool,
}

/// Called when the client's auth state changes to signed in. Creates the
/// first workspace for a verified user who has none and picks the active one.
pub async fn establish(state: &AppState, user: &AuthenticatedUser) -> AppResult<SessionInfo> {
    let store = state.store.as_ref();
    let mut workspaces = Workspace::list_for_user(store, &user.user_id).await?;
    let created_workspace = workspaces.is_empty() && user.email_verified;

    if created_workspace {
        let workspace =
            Workspace::create_default(store, &user.user_id, &user.email, user.name.as_deref()).await?;
        info!("Created default workspace {} for {}", workspace.url, user.user_id);
        workspaces.push(workspace);
    }

    let current = state.sessions.current(&user.user_id).await;
    let active = current
        .and_then(|id| workspaces.iter().find(|w| w.id == id).cloned())
        .or_else(|| workspaces.first().cloned());

    match &active {
        Some(workspace) => state.sessions.activate(&user.user_id, &workspace.id).await,
        None => state.sessions.clear(&user.user_id).await,
    }

    Ok(SessionInfo {
        user_id: user.user_id.clone(),
        email: user.email.clone(),
        email_verified: user.email_verified,
        workspace: active,
        workspaces,
        created_workspace,
    })
}

/// Where to send a user whose URL names a workspace they cannot open: the
/// same page under their current workspace, or the landing page.
pub async fn fallback_location(
    state: &AppState,
    user_id: &str,
    requested_slug: &str,
    path: &str,
    query: &str,
) -> AppResult<String> {
    let store = state.store.as_ref();
    let mut target = match state.sessions.current(user_id).await {
        Some(id) => Workspace::get(store, &id).await?,
        None => None,
    }
    .filter(|w| w.url != requested_slug);
    if target.is_none() {
        target = Workspace::list_for_user(store, user_id)
            .await?
            .into_iter()
            .find(|w| w.url != requested_slug);
    }

    let Some(workspace) = target else {
        return Ok("/".to_string());
    };

    let prefix = format!("/w/{}", requested_slug);
    let rest = path.strip_prefix(&prefix).unwrap_or("");
    let mut location = format!("/w/{}{}", workspace.url, rest);
    if !query.is_empty() {
        location.push('?');
        location.push_str(query);
    }
    Ok(location)
}

/// The workspace named in the URL, checked against the caller's membership.
#[derive(Debug, Clone)]
pub struct WorkspaceScope {
    pub workspace: Workspace,
    pub member: WorkspaceMember,
    pub user: AuthenticatedUser,
}

impl WorkspaceScope {
    pub fn id(&self) -> &str {
        &self.workspace.id
    }

    pub fn require_manager(&self) -> AppResult<()> {
        if self.member.role.can_manage() {
            Ok(())
        } else {
            Err(AppError::Forbidden(
                "Only workspace owners and admins can do that".to_string(),
            ))
        }
    }

    async fn extract(req: HttpRequest) -> AppResult<Self> {
        let user = req
            .extensions()
            .get::<AuthenticatedUser>()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized("Sign in required".to_string()))?;
        let state = req
            .app_data::<web::Data<Arc<AppState>>>()
            .cloned()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("application state missing")))?;
        let slug = req.match_info().get("workspace").unwrap_or_default().to_string();

        let store = state.store.as_ref();
        if let Some(workspace) = state.workspace_cache.resolve(store, &slug).await? {
            if let Some(member) = WorkspaceMember::get(store, &workspace.id, &user.user_id).await? {
                state.sessions.activate(&user.user_id, &workspace.id).await;
                return Ok(WorkspaceScope {
                    workspace,
                    member,
                    user,
                });
            }
            warn!("User {} is not a member of /{}", user.user_id, slug);
        } else {
            debug!("No workspace at /{}", slug);
        }

        let location =
            fallback_location(&state, &user.user_id, &slug, req.path(), req.query_string()).await?;
        Err(AppError::Redirect(location))
    }
}

impl FromRequest for WorkspaceScope {
    type Error = AppError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        Box::pin(Self::extract(req.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::models::workspace::CreateWorkspace;
    use crate::store::MemoryStore;

    fn user(id: &str, verified: bool) -> AuthenticatedUser {
        AuthenticatedUser {
            user_id: id.into(),
            email: format!("{}@acme.co", id),
            name: Some("Ann".into()),
            email_verified: verified,
        }
    }

    async fn state() -> AppState {
        AppState::new(
            AppConfig::local("http://127.0.0.1:9", "secret"),
            Arc::new(MemoryStore::new()),
            None,
            None,
        )
    }

    #[tokio::test]
    async fn first_sign_in_creates_a_workspace_when_verified() {
        let state = state().await;
        let info = establish(&state, &user("u1", true)).await.unwrap();
        assert_eq!(info.workspaces.len(), 1);
        assert!(info.created_workspace);
        let workspace = info.workspace.unwrap();
        assert_eq!(state.sessions.current("u1").await, Some(workspace.id.clone()));

        // Signing in again reuses it.
        let again = establish(&state, &user("u1", true)).await.unwrap();
        assert_eq!(again.workspaces.len(), 1);
        assert!(!again.created_workspace);
        assert_eq!(again.workspace.unwrap().id, workspace.id);
    }

    #[tokio::test]
    async fn unverified_user_gets_no_workspace() {
        let state = state().await;
        let info = establish(&state, &user("u2", false)).await.unwrap();
        assert!(info.workspace.is_none());
        assert!(state.sessions.current("u2").await.is_none());
    }

    #[tokio::test]
    async fn cache_follows_slug_changes() {
        let state = state().await;
        let store = state.store.as_ref();
        let workspace = Workspace::create(
            store,
            "u1",
            "u1@acme.co",
            "Ann",
            CreateWorkspace {
                name: "Acme".into(),
                url: "acme".into(),
                description: None,
                settings: None,
            },
        )
        .await
        .unwrap();

        assert!(state.workspace_cache.resolve(store, "acme").await.unwrap().is_some());
        Workspace::update(
            store,
            &workspace.id,
            crate::models::workspace::UpdateWorkspace {
                url: Some("acme-co".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(state.workspace_cache.resolve(store, "acme").await.unwrap().is_none());
        assert!(state.workspace_cache.resolve(store, "acme-co").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fallback_keeps_the_sub_path() {
        let state = state().await;
        let info = establish(&state, &user("u1", true)).await.unwrap();
        let slug = info.workspace.unwrap().url;

        let location = fallback_location(&state, "u1", "nope", "/w/nope/agents/a1", "tab=kb")
            .await
            .unwrap();
        assert_eq!(location, format!("/w/{}/agents/a1?tab=kb", slug));

        let nowhere = fallback_location(&state, "stranger", "nope", "/w/nope/agents", "")
            .await
            .unwrap();
        assert_eq!(nowhere, "/");
    }

    #[tokio::test]
    async fn fallback_skips_the_requested_workspace() {
        let state = state().await;
        let info = establish(&state, &user("u1", true)).await.unwrap();
        let first = info.workspace.unwrap().url;
        let second = Workspace::create(
            state.store.as_ref(),
            "u1",
            "u1@acme.co",
            "Ann",
            CreateWorkspace {
                name: "Beta".into(),
                url: "beta".into(),
                description: None,
                settings: None,
            },
        )
        .await
        .unwrap();
        state.sessions.activate("u1", &second.id).await;

        let location = fallback_location(&state, "u1", "beta", "/w/beta/inbox", "")
            .await
            .unwrap();
        assert_eq!(location, format!("/w/{}/inbox", first));
    }
}
