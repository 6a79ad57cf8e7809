use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::error::{AppError, AppResult};
use crate::store::{self, encode, Collection, Direction, DocumentStore, Query, StoreError, Write};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
}

impl MemberRole {
    pub fn permissions(&self) -> Vec<String> {
        let perms: &[&str] = match self {
            MemberRole::Owner => &["*"],
            MemberRole::Admin => &["read", "write", "manage"],
            MemberRole::Member => &["read", "write"],
        };
        perms.iter().map(|p| p.to_string()).collect()
    }

    pub fn can_manage(&self) -> bool {
        matches!(self, MemberRole::Owner | MemberRole::Admin)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceMember {
    #[serde(default)]
    pub id: String,
    pub user_id: String,
    pub workspace_id: String,
    pub role: MemberRole,
    pub permissions: Vec<String>,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub joined_at: i64,
}

pub fn member_id(user_id: &str, workspace_id: &str) -> String {
    format!("{}_{}", user_id, workspace_id)
}

impl WorkspaceMember {
    pub fn new(
        user_id: &str,
        workspace_id: &str,
        role: MemberRole,
        email: &str,
        display_name: &str,
    ) -> Self {
        WorkspaceMember {
            id: member_id(user_id, workspace_id),
            user_id: user_id.to_string(),
            workspace_id: workspace_id.to_string(),
            role,
            permissions: role.permissions(),
            email: email.to_string(),
            display_name: display_name.to_string(),
            joined_at: 0,
        }
    }

    /// Insert write with `joinedAt` stamped by the store.
    pub fn create_write(&self) -> Result<Write, StoreError> {
        Ok(Write::create(Collection::WorkspaceMembers, &self.id, encode(self)?)
            .with_server_timestamp("joinedAt"))
    }

    pub async fn get(
        store: &dyn DocumentStore,
        workspace_id: &str,
        user_id: &str,
    ) -> AppResult<Option<Self>> {
        Ok(store::fetch(
            store,
            Collection::WorkspaceMembers,
            &member_id(user_id, workspace_id),
        )
        .await?)
    }

    pub async fn list(store: &dyn DocumentStore, workspace_id: &str) -> AppResult<Vec<Self>> {
        let members = store::fetch_all(
            store,
            &Query::new(Collection::WorkspaceMembers)
                .filter("workspaceId", workspace_id)
                .order_by("joinedAt", Direction::Asc),
        )
        .await?;
        Ok(members)
    }

    pub async fn add(
        store: &dyn DocumentStore,
        workspace_id: &str,
        user_id: &str,
        role: MemberRole,
        email: &str,
        display_name: &str,
    ) -> AppResult<Self> {
        if role == MemberRole::Owner {
            return Err(AppError::Validation(
                "A workspace has exactly one owner".to_string(),
            ));
        }

        let member = WorkspaceMember::new(user_id, workspace_id, role, email, display_name);
        match store.commit(vec![member.create_write()?]).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists { .. }) => {
                return Err(AppError::Conflict(
                    "User is already a member of this workspace".to_string(),
                ))
            }
            Err(e) => return Err(e.into()),
        }

        info!("Added {} to workspace {} as {:?}", user_id, workspace_id, role);
        Self::get(store, workspace_id, user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("member {}", member.id)))
    }

    pub async fn remove(store: &dyn DocumentStore, workspace_id: &str, user_id: &str) -> AppResult<()> {
        let member = Self::get(store, workspace_id, user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("User is not a member of this workspace".to_string()))?;

        if member.role == MemberRole::Owner {
            return Err(AppError::Forbidden(
                "The workspace owner cannot be removed".to_string(),
            ));
        }

        store
            .commit(vec![Write::delete(Collection::WorkspaceMembers, &member.id)])
            .await?;
        debug!("Removed {} from workspace {}", user_id, workspace_id);
        Ok(())
    }
}
