use std::sync::Arc;

use actix_web::{delete, get, patch, post, web, Error, HttpResponse};
use bytes::Bytes;
use futures::stream;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::context::WorkspaceScope;
use crate::email::Email;
use crate::error::AppResult;
use crate::live::Inbox;
use crate::models::agent::Agent;
use crate::models::conversation::{Conversation, NewConversation};
use crate::models::message::{Message, NewMessage, Sender};
use crate::routes::Ack;
use crate::types::{HandoverRequest, StatusRequest};
use crate::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConversationDetail {
    #[serde(flatten)]
    conversation: Conversation,
    messages: Vec<Message>,
}

/// Streams inbox events as server-sent events until the client goes away.
/// Dropping the stream drops the inbox, which detaches its live queries.
fn event_stream(inbox: Inbox) -> HttpResponse {
    let body = stream::unfold(inbox, |mut inbox| async move {
        let chunk = match inbox.next_event().await? {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => format!("data: {}\n\n", json),
                Err(e) => {
                    error!("Failed to encode inbox event: {}", e);
                    return None;
                }
            },
            Err(e) => {
                error!("Inbox feed failed: {}", e);
                format!("event: error\ndata: {}\n\n", serde_json::json!({ "error": e.to_string() }))
            }
        };
        Some((Ok::<Bytes, Error>(Bytes::from(chunk)), inbox))
    });

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(body)
}

#[get("/agents/{agent_id}/conversations")]
async fn list_conversations(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
) -> AppResult<web::Json<Vec<Conversation>>> {
    let (_, agent_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    Ok(web::Json(Conversation::list_for_agent(store, &agent.id).await?))
}

#[post("/agents/{agent_id}/conversations")]
async fn create_conversation(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
    web::Json(data): web::Json<NewConversation>,
) -> AppResult<HttpResponse> {
    let (_, agent_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    let conversation = Conversation::create(store, &agent, data).await?;
    Ok(HttpResponse::Created().json(conversation))
}

#[get("/agents/{agent_id}/conversations/live")]
async fn live_conversations(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String)>,
) -> AppResult<HttpResponse> {
    let (_, agent_id) = path.into_inner();
    let agent = Agent::get_in_workspace(app_state.store.as_ref(), scope.id(), &agent_id).await?;

    let mut inbox = Inbox::new(app_state.store.clone());
    inbox.watch_agent(&agent.id).await?;
    debug!("{} watching inbox of agent {}", scope.user.user_id, agent.id);
    Ok(event_stream(inbox))
}

#[get("/agents/{agent_id}/conversations/{conversation_id}")]
async fn get_conversation(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String, String)>,
) -> AppResult<web::Json<ConversationDetail>> {
    let (_, agent_id, conversation_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    let conversation = Conversation::get_for_agent(store, &agent.id, &conversation_id).await?;
    let messages = Message::list(store, &conversation.id).await?;
    Ok(web::Json(ConversationDetail {
        conversation,
        messages,
    }))
}

#[get("/agents/{agent_id}/conversations/{conversation_id}/live")]
async fn live_thread(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String, String)>,
) -> AppResult<HttpResponse> {
    let (_, agent_id, conversation_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    let conversation = Conversation::get_for_agent(store, &agent.id, &conversation_id).await?;

    let mut inbox = Inbox::new(app_state.store.clone());
    inbox.open_conversation(&conversation.id).await?;
    Ok(event_stream(inbox))
}

#[post("/agents/{agent_id}/conversations/{conversation_id}/messages")]
async fn send_message(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String, String)>,
    web::Json(data): web::Json<NewMessage>,
) -> AppResult<HttpResponse> {
    let (_, agent_id, conversation_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    let conversation = Conversation::get_for_agent(store, &agent.id, &conversation_id).await?;
    let message = Message::send(store, &conversation, data).await?;

    // Best effort: a failed notification never fails the reply.
    if message.sender == Sender::Business && !conversation.customer_email.is_empty() {
        let notifier = app_state.notifier.clone();
        let email = Email::ConversationReply {
            email: conversation.customer_email.clone(),
            customer_name: conversation.customer_name.clone(),
            agent_name: agent.name.clone(),
            reply: message.text.clone(),
        };
        actix_web::rt::spawn(async move {
            notifier.send(email).await;
        });
    }

    Ok(HttpResponse::Created().json(message))
}

#[patch("/agents/{agent_id}/conversations/{conversation_id}")]
async fn update_status(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String, String)>,
    web::Json(data): web::Json<StatusRequest>,
) -> AppResult<web::Json<Conversation>> {
    let (_, agent_id, conversation_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    Ok(web::Json(
        Conversation::set_status(store, &agent.id, &conversation_id, data.status).await?,
    ))
}

#[post("/agents/{agent_id}/conversations/{conversation_id}/read")]
async fn mark_read(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String, String)>,
) -> AppResult<web::Json<Conversation>> {
    let (_, agent_id, conversation_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    Ok(web::Json(
        Conversation::mark_read(store, &agent.id, &conversation_id).await?,
    ))
}

#[post("/agents/{agent_id}/conversations/{conversation_id}/handover")]
async fn request_handover(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String, String)>,
    body: Option<web::Json<HandoverRequest>>,
) -> AppResult<web::Json<Conversation>> {
    let (_, agent_id, conversation_id) = path.into_inner();
    let reason = body
        .map(|b| b.into_inner())
        .unwrap_or_default()
        .reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    Ok(web::Json(
        Conversation::request_handover(store, &agent.id, &conversation_id, reason).await?,
    ))
}

#[delete("/agents/{agent_id}/conversations/{conversation_id}/handover")]
async fn clear_handover(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String, String)>,
) -> AppResult<web::Json<Conversation>> {
    let (_, agent_id, conversation_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    Ok(web::Json(
        Conversation::clear_handover(store, &agent.id, &conversation_id).await?,
    ))
}

#[delete("/agents/{agent_id}/conversations/{conversation_id}")]
async fn delete_conversation(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    path: web::Path<(String, String, String)>,
) -> AppResult<HttpResponse> {
    let (_, agent_id, conversation_id) = path.into_inner();
    let store = app_state.store.as_ref();
    let agent = Agent::get_in_workspace(store, scope.id(), &agent_id).await?;
    let messages = Conversation::delete(store, &agent.id, &conversation_id).await?;
    info!("Conversation {} deleted by {}", conversation_id, scope.user.user_id);
    Ok(HttpResponse::Ok().json(Ack::message(format!(
        "Conversation deleted with {} message(s)",
        messages
    ))))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list_conversations)
        .service(create_conversation)
        .service(live_conversations)
        .service(get_conversation)
        .service(live_thread)
        .service(send_message)
        .service(update_status)
        .service(mark_read)
        .service(request_handover)
        .service(clear_handover)
        .service(delete_conversation);
}
