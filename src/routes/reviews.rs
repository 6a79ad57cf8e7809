use std::sync::Arc;

use actix_web::{delete, get, patch, post, web, HttpResponse};
use tracing::info;

use crate::context::WorkspaceScope;
use crate::error::{AppError, AppResult};
use crate::models::review::{
    ReviewAnalytics, ReviewForm, ReviewFormInput, ReviewSubmission, SubmitReview, UpdateReviewForm,
};
use crate::routes::Ack;
use crate::AppState;

#[get("/review-forms")]
async fn list_forms(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
) -> AppResult<web::Json<Vec<ReviewForm>>> {
    Ok(web::Json(ReviewForm::list(app_state.store.as_ref(), scope.id()).await?))
}

#[post("/review-forms")]
async fn create_form(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    web::Json(data): web::Json<ReviewFormInput>,
) -> AppResult<HttpResponse> {
    let form = ReviewForm::create(app_state.store.as_ref(), scope.id(), data).await?;
    info!("Review form {} created in {}", form.id, scope.id());
    Ok(HttpResponse::Created().json(form))
}

#[get("/review-forms/{form_id}")]
async fn get_form(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
) -> AppResult<web::Json<ReviewForm>> {
    let (_, form_id) = path.into_inner();
    Ok(web::Json(
        ReviewForm::get_in_workspace(app_state.store.as_ref(), scope.id(), &form_id).await?,
    ))
}

#[patch("/review-forms/{form_id}")]
async fn update_form(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
    web::Json(data): web::Json<UpdateReviewForm>,
) -> AppResult<web::Json<ReviewForm>> {
    let (_, form_id) = path.into_inner();
    Ok(web::Json(
        ReviewForm::update(app_state.store.as_ref(), scope.id(), &form_id, data).await?,
    ))
}

#[delete("/review-forms/{form_id}")]
async fn delete_form(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
) -> AppResult<HttpResponse> {
    let (_, form_id) = path.into_inner();
    ReviewForm::delete(app_state.store.as_ref(), scope.id(), &form_id).await?;
    Ok(HttpResponse::Ok().json(Ack::message("Review form deleted")))
}

#[get("/review-forms/{form_id}/submissions")]
async fn list_submissions(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
) -> AppResult<web::Json<Vec<ReviewSubmission>>> {
    let (_, form_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let form = ReviewForm::get_in_workspace(store, scope.id(), &form_id).await?;
    Ok(web::Json(ReviewForm::submissions(store, &form.id).await?))
}

#[get("/review-forms/{form_id}/analytics")]
async fn form_analytics(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
) -> AppResult<web::Json<ReviewAnalytics>> {
    let (_, form_id) = path.into_inner();
    Ok(web::Json(
        ReviewForm::analytics(app_state.store.as_ref(), scope.id(), &form_id).await?,
    ))
}

/// What respondents load. Inactive forms look missing.
#[get("/review-forms/{form_id}")]
async fn public_form(
    app_state: web::Data<Arc<AppState>>,
    form_id: web::Path<String>,
) -> AppResult<web::Json<ReviewForm>> {
    ReviewForm::get(app_state.store.as_ref(), &form_id)
        .await?
        .filter(|form| form.is_active)
        .map(web::Json)
        .ok_or_else(|| AppError::NotFound("Review form".to_string()))
}

#[post("/review-forms/{form_id}/submit")]
async fn submit_review(
    app_state: web::Data<Arc<AppState>>,
    form_id: web::Path<String>,
    web::Json(data): web::Json<SubmitReview>,
) -> AppResult<HttpResponse> {
    let submission = ReviewForm::submit(app_state.store.as_ref(), &form_id, data).await?;
    Ok(HttpResponse::Created().json(submission))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list_forms)
        .service(create_form)
        .service(get_form)
        .service(update_form)
        .service(delete_form)
        .service(list_submissions)
        .service(form_analytics);
}

pub fn configure_public(cfg: &mut web::ServiceConfig) {
    cfg.service(public_form).service(submit_review);
}
