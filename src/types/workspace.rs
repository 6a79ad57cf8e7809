use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::member::MemberRole;

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InviteRequest {
    pub email: String,
    pub role: MemberRole,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddMemberRequest {
    pub user_id: String,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub role: MemberRole,
}

#[derive(Deserialize)]
pub struct SlugQuery {
    pub url: String,
}

#[derive(Serialize, ToSchema)]
pub struct SlugAvailability {
    pub url: String,
    pub available: bool,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedInvite {
    pub workspace_id: String,
}
