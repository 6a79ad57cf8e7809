use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::agent::Agent;
use crate::models::member::{MemberRole, WorkspaceMember};
use crate::store::{self, encode, Collection, Direction, DocumentStore, Patch, Query, Write};

lazy_static! {
    static ref SLUG_RE: Regex = Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").expect("valid slug regex");
}

pub const SLUG_MIN_LEN: usize = 3;
pub const SLUG_MAX_LEN: usize = 48;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSettings {
    pub primary_color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    pub timezone: String,
    pub language: String,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        WorkspaceSettings {
            primary_color: "#3b82f6".to_string(),
            logo: None,
            timezone: "UTC".to_string(),
            language: "en".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Pro,
    Enterprise,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    #[default]
    Active,
    Trial,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSubscription {
    pub plan: Plan,
    pub status: SubscriptionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// URL slug, unique across all workspaces.
    pub url: String,
    #[serde(default)]
    pub description: String,
    pub owner_id: String,
    #[serde(default)]
    pub settings: WorkspaceSettings,
    #[serde(default)]
    pub subscription: WorkspaceSubscription,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Default for Workspace {
    fn default() -> Self {
        Workspace {
            id: Uuid::new_v4().to_string(),
            name: String::new(),
            url: String::new(),
            description: String::new(),
            owner_id: String::new(),
            settings: WorkspaceSettings::default(),
            subscription: WorkspaceSubscription::default(),
            created_at: 0,
            updated_at: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    pub primary_color: Option<String>,
    pub logo: Option<String>,
    pub timezone: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkspace {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub settings: Option<SettingsUpdate>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWorkspace {
    pub name: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub settings: Option<SettingsUpdate>,
}

impl WorkspaceSettings {
    fn merged(mut self, update: Option<SettingsUpdate>) -> Self {
        if let Some(update) = update {
            if let Some(color) = update.primary_color {
                self.primary_color = color;
            }
            if update.logo.is_some() {
                self.logo = update.logo;
            }
            if let Some(timezone) = update.timezone {
                self.timezone = timezone;
            }
            if let Some(language) = update.language {
                self.language = language;
            }
        }
        self
    }
}

pub fn validate_slug(slug: &str) -> AppResult<()> {
    if slug.len() < SLUG_MIN_LEN || slug.len() > SLUG_MAX_LEN {
        return Err(AppError::Validation(format!(
            "Workspace URL must be between {} and {} characters",
            SLUG_MIN_LEN, SLUG_MAX_LEN
        )));
    }
    if !SLUG_RE.is_match(slug) {
        return Err(AppError::Validation(
            "Workspace URL may only contain lowercase letters, numbers and single hyphens".to_string(),
        ));
    }
    Ok(())
}

/// Lowercases and hyphenates arbitrary text into slug form.
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for c in text.trim().chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

impl Workspace {
    pub async fn get(store: &dyn DocumentStore, id: &str) -> AppResult<Option<Self>> {
        Ok(store::fetch(store, Collection::Workspaces, id).await?)
    }

    pub async fn get_by_slug(store: &dyn DocumentStore, slug: &str) -> AppResult<Option<Self>> {
        let query = Query::new(Collection::Workspaces).filter("url", slug).limit(1);
        let found: Vec<Workspace> = store::fetch_all(store, &query).await?;
        debug!("Workspace lookup by slug {}: {}", slug, !found.is_empty());
        Ok(found.into_iter().next())
    }

    pub async fn slug_exists(store: &dyn DocumentStore, slug: &str) -> AppResult<bool> {
        Ok(store.get(Collection::WorkspaceSlugs, slug).await?.is_some()
            || Self::get_by_slug(store, slug).await?.is_some())
    }

    /// Creates the workspace together with its slug reservation and the
    /// owner membership in one batch. A taken slug fails with
    /// [`AppError::SlugTaken`] whether it is caught by the pre-check or by
    /// the reservation write losing a race.
    pub async fn create(
        store: &dyn DocumentStore,
        owner_id: &str,
        owner_email: &str,
        owner_name: &str,
        data: CreateWorkspace,
    ) -> AppResult<Self> {
        let name = data.name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::Validation("Workspace name is required".to_string()));
        }
        let slug = data.url.trim().to_string();
        validate_slug(&slug)?;

        if Self::slug_exists(store, &slug).await? {
            info!("Workspace URL {} is already taken", slug);
            return Err(AppError::SlugTaken);
        }

        let workspace = Workspace {
            name,
            url: slug.clone(),
            description: data.description.unwrap_or_default(),
            owner_id: owner_id.to_string(),
            settings: WorkspaceSettings::default().merged(data.settings),
            ..Default::default()
        };

        let owner = WorkspaceMember::new(owner_id, &workspace.id, MemberRole::Owner, owner_email, owner_name);

        let writes = vec![
            Write::create(
                Collection::WorkspaceSlugs,
                &slug,
                json!({ "workspaceId": workspace.id }),
            ),
            Write::create(Collection::Workspaces, &workspace.id, encode(&workspace)?),
            owner.create_write()?,
        ];

        match store.commit(writes).await {
            Ok(()) => {}
            Err(store::StoreError::AlreadyExists {
                collection: Collection::WorkspaceSlugs,
                ..
            }) => return Err(AppError::SlugTaken),
            Err(e) => return Err(e.into()),
        }

        info!("Workspace created: {} ({})", workspace.id, workspace.url);
        Self::get(store, &workspace.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("workspace {}", workspace.id)))
    }

    /// First sign-in: `"{name}'s Workspace"` at a unique generated slug.
    pub async fn create_default(
        store: &dyn DocumentStore,
        owner_id: &str,
        owner_email: &str,
        display_name: Option<&str>,
    ) -> AppResult<Self> {
        let display_name = display_name.map(str::trim).filter(|n| !n.is_empty());
        let name = format!("{}'s Workspace", display_name.unwrap_or("My"));
        let base = display_name
            .map(slugify)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "my-workspace".to_string());
        let stamp = Utc::now().timestamp_millis().to_string();
        let max_base = SLUG_MAX_LEN - stamp.len() - 1;
        let base = base.get(..max_base.min(base.len())).unwrap_or(&base).trim_end_matches('-');
        let url = format!("{}-{}", base, stamp);

        Self::create(
            store,
            owner_id,
            owner_email,
            display_name.unwrap_or(owner_email),
            CreateWorkspace {
                name,
                url,
                description: Some("Your default workspace".to_string()),
                settings: None,
            },
        )
        .await
    }

    /// Workspaces the user is a member of, oldest membership first.
    pub async fn list_for_user(store: &dyn DocumentStore, user_id: &str) -> AppResult<Vec<Self>> {
        let memberships: Vec<WorkspaceMember> = store::fetch_all(
            store,
            &Query::new(Collection::WorkspaceMembers)
                .filter("userId", user_id)
                .order_by("joinedAt", Direction::Asc),
        )
        .await?;

        let mut workspaces = Vec::with_capacity(memberships.len());
        for membership in memberships {
            if let Some(workspace) = Self::get(store, &membership.workspace_id).await? {
                workspaces.push(workspace);
            }
        }
        Ok(workspaces)
    }

    pub async fn update(
        store: &dyn DocumentStore,
        id: &str,
        data: UpdateWorkspace,
    ) -> AppResult<Self> {
        let current = Self::get(store, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("workspace {}", id)))?;

        let mut patch = Patch::new();
        let mut writes = Vec::new();

        if let Some(name) = data.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(AppError::Validation("Workspace name is required".to_string()));
            }
            patch = patch.set("name", name);
        }
        if let Some(description) = data.description {
            patch = patch.set("description", description);
        }
        if data.settings.is_some() {
            let settings = current.settings.clone().merged(data.settings);
            patch = patch.set("settings", serde_json::to_value(settings).map_err(store::StoreError::from)?);
        }
        if let Some(slug) = data.url.map(|s| s.trim().to_string()) {
            if slug != current.url {
                validate_slug(&slug)?;
                if Self::slug_exists(store, &slug).await? {
                    return Err(AppError::SlugTaken);
                }
                writes.push(Write::create(
                    Collection::WorkspaceSlugs,
                    &slug,
                    json!({ "workspaceId": id }),
                ));
                writes.push(Write::delete(Collection::WorkspaceSlugs, &current.url));
                patch = patch.set("url", slug);
            }
        }

        writes.push(Write::update(Collection::Workspaces, id, patch));
        match store.commit(writes).await {
            Ok(()) => {}
            Err(store::StoreError::AlreadyExists {
                collection: Collection::WorkspaceSlugs,
                ..
            }) => return Err(AppError::SlugTaken),
            Err(e) => return Err(e.into()),
        }

        debug!("Workspace updated: {}", id);
        Self::get(store, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("workspace {}", id)))
    }

    pub async fn set_subscription(
        store: &dyn DocumentStore,
        id: &str,
        subscription: &WorkspaceSubscription,
    ) -> AppResult<()> {
        let value = serde_json::to_value(subscription).map_err(store::StoreError::from)?;
        store
            .commit(vec![Write::update(
                Collection::Workspaces,
                id,
                Patch::new().set("subscription", value),
            )])
            .await?;
        info!("Workspace {} subscription set to {:?}", id, subscription.plan);
        Ok(())
    }

    /// Removes the workspace and everything scoped to it in one batch.
    /// Vector entries of its knowledge items go through the deletion outbox.
    pub async fn delete(store: &dyn DocumentStore, id: &str) -> AppResult<()> {
        let workspace = Self::get(store, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("workspace {}", id)))?;

        let mut writes = Vec::new();
        for agent in Agent::list(store, id).await? {
            writes.extend(Agent::cascade_writes(store, &agent).await?);
        }
        for collection in [Collection::WorkspaceMembers, Collection::WorkspaceInvites] {
            for doc in store
                .query(&Query::new(collection).filter("workspaceId", id))
                .await?
            {
                writes.push(Write::delete(collection, &doc.id));
            }
        }
        writes.push(Write::delete(Collection::WorkspaceSlugs, &workspace.url));
        writes.push(Write::delete(Collection::Workspaces, id));

        let count = writes.len();
        store.commit(writes).await?;
        info!("Workspace {} deleted ({} documents)", id, count);
        Ok(())
    }
}
