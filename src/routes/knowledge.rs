use std::sync::Arc;

use actix_multipart::Multipart;
use actix_web::{delete, get, patch, post, web, HttpResponse};
use futures::TryStreamExt;
use tracing::{debug, info, warn};

use crate::context::WorkspaceScope;
use crate::error::{AppError, AppResult};
use crate::ingest::{self, SubmissionForm, UploadedFile};
use crate::models::agent::Agent;
use crate::models::knowledge::{DeleteOutcome, KnowledgeItem, KnowledgeType, UpdateKnowledgeItem};
use crate::routes::Ack;
use crate::AppState;

const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

#[get("/knowledge")]
async fn list_workspace_knowledge(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
) -> AppResult<web::Json<Vec<KnowledgeItem>>> {
    Ok(web::Json(
        KnowledgeItem::list_for_workspace(app_state.store.as_ref(), scope.id()).await?,
    ))
}

/// Wipes the whole vector collection on the backend. Local records are
/// left alone.
#[post("/knowledge/clean")]
async fn clean_vectors(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
) -> AppResult<HttpResponse> {
    scope.require_manager()?;
    app_state.backend.clean().await?;
    warn!("Vector collection cleaned by {}", scope.user.user_id);
    Ok(HttpResponse::Ok().json(Ack::message("Vector collection cleaned")))
}

#[get("/agents/{agent_id}/knowledge")]
async fn list_agent_knowledge(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
) -> AppResult<web::Json<Vec<KnowledgeItem>>> {
    let (_, agent_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    Ok(web::Json(KnowledgeItem::list_for_agent(store, &agent.id).await?))
}

#[post("/agents/{agent_id}/knowledge")]
async fn add_knowledge(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
    web::Json(form): web::Json<SubmissionForm>,
) -> AppResult<HttpResponse> {
    let (_, agent_id) = path.into_inner();
    let agent = Agent::get_in_workspace(app_state.store.as_ref(), scope.id(), &agent_id).await?;
    let draft = form.validate()?;
    let item = ingest::submit(&app_state, &scope.user, &agent, draft).await?;
    Ok(HttpResponse::Created().json(item))
}

/// Reads the dialog's multipart form: `file` plus the text fields of
/// [`SubmissionForm`].
async fn read_upload(mut payload: Multipart) -> AppResult<SubmissionForm> {
    let mut form = SubmissionForm {
        kind: KnowledgeType::Pdf,
        ..Default::default()
    };

    let invalid =
        |e: actix_multipart::MultipartError| AppError::Validation(format!("Invalid upload: {}", e));

    while let Some(mut field) = payload.try_next().await.map_err(invalid)? {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_string);
        let content_type = field
            .content_type()
            .map(|mime| mime.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let mut bytes = Vec::new();
        while let Some(chunk) = field.try_next().await.map_err(invalid)? {
            if bytes.len() + chunk.len() > MAX_UPLOAD_BYTES {
                return Err(AppError::Validation("File is larger than 25 MB".to_string()));
            }
            bytes.extend_from_slice(&chunk);
        }

        if name == "file" {
            form.file = Some(UploadedFile {
                file_name: file_name.unwrap_or_else(|| "upload".to_string()),
                content_type,
                bytes,
            });
            continue;
        }

        let text = String::from_utf8_lossy(&bytes).trim().to_string();
        match name.as_str() {
            "type" => {
                form.kind = match text.as_str() {
                    "text" => KnowledgeType::Text,
                    _ => KnowledgeType::Pdf,
                }
            }
            "title" => form.title = Some(text),
            "tags" => form.tags = Some(text),
            other => debug!("Ignoring upload field {}", other),
        }
    }

    Ok(form)
}

#[post("/agents/{agent_id}/knowledge/upload")]
async fn upload_knowledge(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
    payload: Multipart,
) -> AppResult<HttpResponse> {
    let (_, agent_id) = path.into_inner();
    let agent = Agent::get_in_workspace(app_state.store.as_ref(), scope.id(), &agent_id).await?;
    let draft = read_upload(payload).await?.validate()?;
    let item = ingest::submit(&app_state, &scope.user, &agent, draft).await?;
    Ok(HttpResponse::Created().json(item))
}

#[get("/agents/{agent_id}/knowledge/{item_id}")]
async fn get_knowledge(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String, String)>,
) -> AppResult<web::Json<KnowledgeItem>> {
    let (_, agent_id, item_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    Ok(web::Json(KnowledgeItem::get_for_agent(store, &agent.id, &item_id).await?))
}

#[patch("/agents/{agent_id}/knowledge/{item_id}")]
async fn update_knowledge(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String, String)>,
    web::Json(data): web::Json<UpdateKnowledgeItem>,
) -> AppResult<web::Json<KnowledgeItem>> {
    let (_, agent_id, item_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    Ok(web::Json(
        KnowledgeItem::update(store, &agent.id, &item_id, data).await?,
    ))
}

fn deleted_response(outcome: DeleteOutcome, message: &str) -> HttpResponse {
    match outcome {
        DeleteOutcome::Deleted => HttpResponse::Ok().json(Ack::message(message)),
        DeleteOutcome::VectorPending(reason) => HttpResponse::Ok().json(Ack::warning(
            message,
            format!(
                "Removed locally; the AI backend has not confirmed yet and will be retried ({})",
                reason
            ),
        )),
    }
}

#[delete("/agents/{agent_id}/knowledge/{item_id}")]
async fn delete_knowledge(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String, String)>,
) -> AppResult<HttpResponse> {
    let (_, agent_id, item_id) = path.into_inner();
    let agent = Agent::get_in_workspace(app_state.store.as_ref(), scope.id(), &agent_id).await?;
    let outcome = KnowledgeItem::delete(
        app_state.store.as_ref(),
        &app_state.backend,
        app_state.blobs.as_ref(),
        &agent.id,
        &item_id,
    )
    .await?;
    info!("Knowledge item {} deleted by {}", item_id, scope.user.user_id);
    Ok(deleted_response(outcome, "Knowledge item deleted"))
}

#[delete("/agents/{agent_id}/knowledge")]
async fn delete_all_knowledge(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
) -> AppResult<HttpResponse> {
    let (_, agent_id) = path.into_inner();
    let agent = Agent::get_in_workspace(app_state.store.as_ref(), scope.id(), &agent_id).await?;
    let (count, outcome) = KnowledgeItem::delete_all(
        app_state.store.as_ref(),
        &app_state.backend,
        scope.id(),
        &agent.id,
    )
    .await?;
    Ok(deleted_response(
        outcome,
        &format!("Deleted {} knowledge item(s)", count),
    ))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list_workspace_knowledge)
        .service(clean_vectors)
        .service(list_agent_knowledge)
        .service(add_knowledge)
        .service(upload_knowledge)
        .service(get_knowledge)
        .service(update_knowledge)
        .service(delete_knowledge)
        .service(delete_all_knowledge);
}
