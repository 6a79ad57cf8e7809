use std::sync::Arc;

use actix_web::{delete, get, patch, post, web, HttpResponse};

use crate::context::WorkspaceScope;
use crate::email::Email;
use crate::error::AppResult;
use crate::models::agent::Agent;
use crate::models::widget::{CreateWidget, UpdateWidget, Widget, WidgetSummary};
use crate::routes::Ack;
use crate::AppState;

#[get("/agents/{agent_id}/widgets")]
async fn list_widgets(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
) -> AppResult<web::Json<Vec<WidgetSummary>>> {
    let (_, agent_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    Ok(web::Json(Widget::list_for_agent(store, &agent.id).await?))
}

#[post("/agents/{agent_id}/widgets")]
async fn create_widget(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
    web::Json(data): web::Json<CreateWidget>,
) -> AppResult<HttpResponse> {
    let (_, agent_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    let widget = Widget::create(store, &agent, data).await?;

    // The first widget puts the agent in front of visitors.
    if Widget::count_for_agent(store, &agent.id).await? == 1 {
        let notifier = app_state.notifier.clone();
        let email = Email::AgentDeployed {
            email: scope.user.email.clone(),
            user_name: scope.user.display_name(),
            agent_name: agent.name.clone(),
            dashboard_link: format!(
                "{}/dashboard/{}/agents/{}",
                app_state.config.dashboard_url, scope.workspace.url, agent.id
            ),
        };
        actix_web::rt::spawn(async move {
            notifier.send(email).await;
        });
    }

    Ok(HttpResponse::Created().json(widget))
}

#[get("/agents/{agent_id}/widgets/{widget_id}")]
async fn get_widget(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String, String)>,
) -> AppResult<web::Json<Widget>> {
    let (_, agent_id, widget_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    Ok(web::Json(Widget::get_for_agent(store, &agent.id, &widget_id).await?))
}

#[patch("/agents/{agent_id}/widgets/{widget_id}")]
async fn update_widget(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String, String)>,
    web::Json(data): web::Json<UpdateWidget>,
) -> AppResult<web::Json<Widget>> {
    let (_, agent_id, widget_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    Ok(web::Json(
        Widget::update(store, &agent.id, &widget_id, data).await?,
    ))
}

#[post("/agents/{agent_id}/widgets/{widget_id}/toggle")]
async fn toggle_widget(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String, String)>,
) -> AppResult<web::Json<Widget>> {
    let (_, agent_id, widget_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    Ok(web::Json(Widget::toggle(store, &agent.id, &widget_id).await?))
}

#[post("/agents/{agent_id}/widgets/{widget_id}/duplicate")]
async fn duplicate_widget(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String, String)>,
) -> AppResult<HttpResponse> {
    let (_, agent_id, widget_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    Ok(HttpResponse::Created().json(Widget::duplicate(store, &agent.id, &widget_id).await?))
}

#[delete("/agents/{agent_id}/widgets/{widget_id}")]
async fn delete_widget(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String, String)>,
) -> AppResult<HttpResponse> {
    let (_, agent_id, widget_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    Widget::delete(store, &agent.id, &widget_id).await?;
    Ok(HttpResponse::Ok().json(Ack::message("Widget deleted")))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list_widgets)
        .service(create_widget)
        .service(get_widget)
        .service(update_widget)
        .service(toggle_widget)
        .service(duplicate_widget)
        .service(delete_widget);
}
