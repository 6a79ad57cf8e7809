use serde::Deserialize;
use utoipa::ToSchema;

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotionConnectionRequest {
    pub api_key: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotionSearchRequest {
    pub api_key: String,
    #[serde(default)]
    pub query: String,
}
