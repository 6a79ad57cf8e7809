use serde::Deserialize;
use utoipa::ToSchema;

use crate::models::conversation::ConversationStatus;

#[derive(Deserialize, ToSchema)]
pub struct StatusRequest {
    pub status: ConversationStatus,
}

#[derive(Deserialize, ToSchema, Default)]
pub struct HandoverRequest {
    #[serde(default)]
    pub reason: Option<String>,
}
