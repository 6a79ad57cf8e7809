use std::sync::Arc;

use actix_web::{delete, get, post, web, HttpResponse};
use tracing::{error, info};

use crate::context::{self, SessionInfo};
use crate::email::Email;
use crate::error::AppResult;
use crate::middleware::auth::AuthenticatedUser;
use crate::routes::Ack;
use crate::AppState;

/// The client reports a signed-in user: load (or create) their workspace
/// context.
#[post("/session")]
async fn start_session(
    app_state: web::Data<Arc<AppState>>,
    authenticated_user: AuthenticatedUser,
) -> AppResult<web::Json<SessionInfo>> {
    let session = context::establish(&app_state, &authenticated_user)
        .await
        .map_err(|e| {
            error!("Failed to establish session for {}: {}", authenticated_user.user_id, e);
            e
        })?;

    if session.created_workspace {
        let notifier = app_state.notifier.clone();
        let email = Email::Welcome {
            email: authenticated_user.email.clone(),
            name: authenticated_user.display_name(),
        };
        actix_web::rt::spawn(async move {
            notifier.send(email).await;
        });
    }

    info!("Session started for {}", authenticated_user.user_id);
    Ok(web::Json(session))
}

#[get("/session")]
async fn current_session(
    app_state: web::Data<Arc<AppState>>,
    authenticated_user: AuthenticatedUser,
) -> AppResult<web::Json<SessionInfo>> {
    Ok(web::Json(context::establish(&app_state, &authenticated_user).await?))
}

#[delete("/session")]
async fn end_session(
    app_state: web::Data<Arc<AppState>>,
    authenticated_user: AuthenticatedUser,
) -> HttpResponse {
    app_state.sessions.clear(&authenticated_user.user_id).await;
    info!("Session ended for {}", authenticated_user.user_id);
    HttpResponse::Ok().json(Ack::ok())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(start_session)
        .service(current_session)
        .service(end_session);
}
