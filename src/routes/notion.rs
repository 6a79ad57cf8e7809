use std::sync::Arc;

use actix_web::{post, web};
use serde_json::Value;

use crate::backend::NotionPage;
use crate::context::WorkspaceScope;
use crate::error::{AppError, AppResult};
use crate::types::{NotionConnectionRequest, NotionSearchRequest};
use crate::AppState;

fn require_key(api_key: &str) -> AppResult<&str> {
    let api_key = api_key.trim();
    if api_key.is_empty() {
        return Err(AppError::Validation(
            "Please enter your Notion API key".to_string(),
        ));
    }
    Ok(api_key)
}

#[post("/notion/test-connection")]
async fn test_connection(
    app_state: web::Data<Arc<AppState>>,
    _scope: WorkspaceScope,
    web::Json(data): web::Json<NotionConnectionRequest>,
) -> AppResult<web::Json<Value>> {
    let api_key = require_key(&data.api_key)?;
    Ok(web::Json(app_state.backend.notion_test_connection(api_key).await?))
}

#[post("/notion/search-pages")]
async fn search_pages(
    app_state: web::Data<Arc<AppState>>,
    _scope: WorkspaceScope,
    web::Json(data): web::Json<NotionSearchRequest>,
) -> AppResult<web::Json<Vec<NotionPage>>> {
    let api_key = require_key(&data.api_key)?;
    Ok(web::Json(
        app_state
            .backend
            .notion_search_pages(api_key, data.query.trim())
            .await?,
    ))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(test_connection).service(search_pages);
}
