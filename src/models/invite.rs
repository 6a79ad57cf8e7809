use chrono::{Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::member::{MemberRole, WorkspaceMember};
use crate::store::{self, encode, Collection, Direction, DocumentStore, Patch, Query, StoreError, Write};

pub const INVITE_TTL_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum InviteStatus {
    Pending,
    Accepted,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInvite {
    #[serde(default)]
    pub id: String,
    pub workspace_id: String,
    pub email: String,
    pub role: MemberRole,
    pub invited_by: String,
    pub token: String,
    pub expires_at: i64,
    pub status: InviteStatus,
    #[serde(default)]
    pub created_at: i64,
}

impl Default for WorkspaceInvite {
    fn default() -> Self {
        WorkspaceInvite {
            id: Uuid::new_v4().to_string(),
            workspace_id: String::new(),
            email: String::new(),
            role: MemberRole::Member,
            invited_by: String::new(),
            token: generate_token(),
            expires_at: (Utc::now() + Duration::days(INVITE_TTL_DAYS)).timestamp_millis(),
            status: InviteStatus::Pending,
            created_at: 0,
        }
    }
}

fn generate_token() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(26)
        .map(char::from)
        .collect()
}

impl WorkspaceInvite {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at < now_ms
    }

    pub async fn create(
        store: &dyn DocumentStore,
        workspace_id: &str,
        email: &str,
        role: MemberRole,
        invited_by: &str,
    ) -> AppResult<Self> {
        let email = email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(AppError::Validation("A valid email address is required".to_string()));
        }
        if role == MemberRole::Owner {
            return Err(AppError::Validation("Invites can only grant admin or member".to_string()));
        }

        let invite = WorkspaceInvite {
            workspace_id: workspace_id.to_string(),
            email,
            role,
            invited_by: invited_by.to_string(),
            ..Default::default()
        };

        store
            .commit(vec![Write::create(
                Collection::WorkspaceInvites,
                &invite.id,
                encode(&invite)?,
            )])
            .await?;

        info!("Invite {} created for {} in {}", invite.id, invite.email, workspace_id);
        store::fetch(store, Collection::WorkspaceInvites, &invite.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("invite {}", invite.id)))
    }

    pub async fn list(store: &dyn DocumentStore, workspace_id: &str) -> AppResult<Vec<Self>> {
        Ok(store::fetch_all(
            store,
            &Query::new(Collection::WorkspaceInvites)
                .filter("workspaceId", workspace_id)
                .order_by("createdAt", Direction::Desc),
        )
        .await?)
    }

    pub async fn find_pending_by_token(store: &dyn DocumentStore, token: &str) -> AppResult<Option<Self>> {
        let start = Instant::now();
        let found: Vec<WorkspaceInvite> = store::fetch_all(
            store,
            &Query::new(Collection::WorkspaceInvites)
                .filter("token", token)
                .filter("status", "pending")
                .limit(1),
        )
        .await?;
        debug!("Invite lookup by token took {:?}", start.elapsed());
        Ok(found.into_iter().next())
    }

    /// Adds the user as a member and marks the invite accepted in one batch.
    /// Returns the workspace id joined.
    pub async fn accept(
        store: &dyn DocumentStore,
        token: &str,
        user_id: &str,
        email: &str,
        display_name: &str,
    ) -> AppResult<String> {
        let invite = Self::find_pending_by_token(store, token)
            .await?
            .ok_or_else(|| AppError::NotFound("Invalid or expired invite".to_string()))?;

        if invite.is_expired(Utc::now().timestamp_millis()) {
            store
                .commit(vec![Write::update(
                    Collection::WorkspaceInvites,
                    &invite.id,
                    Patch::new().set("status", "expired"),
                )])
                .await?;
            return Err(AppError::Validation("Invite has expired".to_string()));
        }

        // Existing members keep their role; the invite stays pending.
        let member = WorkspaceMember::new(user_id, &invite.workspace_id, invite.role, email, display_name);
        let writes = vec![
            member.create_write()?,
            Write::update(
                Collection::WorkspaceInvites,
                &invite.id,
                Patch::new()
                    .set("status", "accepted")
                    .set("acceptedBy", user_id)
                    .server_timestamp("acceptedAt"),
            ),
        ];
        match store.commit(writes).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists {
                collection: Collection::WorkspaceMembers,
                ..
            }) => {
                return Err(AppError::Conflict(
                    "You are already a member of this workspace".to_string(),
                ))
            }
            Err(e) => return Err(e.into()),
        }

        info!("User {} joined workspace {} via invite", user_id, invite.workspace_id);
        Ok(invite.workspace_id)
    }

    pub async fn revoke(store: &dyn DocumentStore, workspace_id: &str, invite_id: &str) -> AppResult<()> {
        let invite: WorkspaceInvite = store::fetch(store, Collection::WorkspaceInvites, invite_id)
            .await?
            .filter(|i: &WorkspaceInvite| i.workspace_id == workspace_id)
            .ok_or_else(|| AppError::NotFound(format!("invite {}", invite_id)))?;
        store
            .commit(vec![Write::delete(Collection::WorkspaceInvites, &invite.id)])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn accept_adds_member_and_consumes_invite() {
        let store = MemoryStore::new();
        let invite = WorkspaceInvite::create(&store, "w1", "Bob@Acme.co", MemberRole::Admin, "u1")
            .await
            .unwrap();
        assert_eq!(invite.email, "bob@acme.co");
        assert_eq!(invite.token.len(), 26);

        let joined = WorkspaceInvite::accept(&store, &invite.token, "u2", "bob@acme.co", "Bob")
            .await
            .unwrap();
        assert_eq!(joined, "w1");

        let member = WorkspaceMember::get(&store, "w1", "u2").await.unwrap().unwrap();
        assert_eq!(member.role, MemberRole::Admin);

        let again = WorkspaceInvite::accept(&store, &invite.token, "u3", "c@acme.co", "C").await;
        assert!(matches!(again, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn existing_member_keeps_role_on_accept() {
        let store = MemoryStore::new();
        store
            .commit(vec![WorkspaceMember::new("u1", "w1", MemberRole::Owner, "ann@acme.co", "Ann")
                .create_write()
                .unwrap()])
            .await
            .unwrap();
        let invite = WorkspaceInvite::create(&store, "w1", "ann@acme.co", MemberRole::Member, "u1")
            .await
            .unwrap();

        let err = WorkspaceInvite::accept(&store, &invite.token, "u1", "ann@acme.co", "Ann")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let owner = WorkspaceMember::get(&store, "w1", "u1").await.unwrap().unwrap();
        assert_eq!(owner.role, MemberRole::Owner);
        let pending = WorkspaceInvite::find_pending_by_token(&store, &invite.token).await.unwrap();
        assert!(pending.is_some());
    }

    #[tokio::test]
    async fn expired_invite_is_rejected() {
        let store = MemoryStore::new();
        let invite = WorkspaceInvite {
            workspace_id: "w1".into(),
            email: "late@acme.co".into(),
            invited_by: "u1".into(),
            expires_at: 1,
            ..Default::default()
        };
        store
            .commit(vec![Write::create(
                Collection::WorkspaceInvites,
                &invite.id,
                encode(&invite).unwrap(),
            )])
            .await
            .unwrap();

        let err = WorkspaceInvite::accept(&store, &invite.token, "u2", "late@acme.co", "Late")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(WorkspaceMember::get(&store, "w1", "u2").await.unwrap().is_none());
    }
}
