pub mod auth;
pub mod backend;
pub mod config;
pub mod context;
pub mod email;
pub mod error;
pub mod ingest;
pub mod live;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod storage;
pub mod store;
pub mod types;

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{get, http::header, web};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

pub use crate::config::AppConfig;

use crate::auth::JWTKeys;
use crate::backend::BackendClient;
use crate::context::{SessionRegistry, WorkspaceCache};
use crate::email::Notifier;
use crate::ingest::InFlight;
use crate::middleware::auth::Authentication;
use crate::storage::BlobStorage;
use crate::store::DocumentStore;

/// Everything a handler can reach, shared behind one `Arc`.
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn DocumentStore>,
    pub backend: BackendClient,
    pub notifier: Notifier,
    pub blobs: Option<BlobStorage>,
    pub stripe_client: Option<stripe::Client>,
    pub keys: Arc<JWTKeys>,
    pub sessions: SessionRegistry,
    pub workspace_cache: WorkspaceCache,
    pub in_flight: InFlight,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn DocumentStore>,
        blobs: Option<BlobStorage>,
        stripe_client: Option<stripe::Client>,
    ) -> Self {
        AppState {
            backend: BackendClient::new(&config.backend_url),
            notifier: Notifier::new(&config.email_api_url, config.loops_api_key.clone()),
            keys: Arc::new(JWTKeys::new(config.jwt_secret.as_bytes())),
            sessions: SessionRegistry::new(),
            workspace_cache: WorkspaceCache::new(),
            in_flight: InFlight::default(),
            config,
            store,
            blobs,
            stripe_client,
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(title = "agentdesk", description = "Workspaces, agents, knowledge and inbox for AI chat agents"),
    components(schemas(
        models::workspace::Workspace,
        models::workspace::CreateWorkspace,
        models::workspace::UpdateWorkspace,
        models::member::WorkspaceMember,
        models::invite::WorkspaceInvite,
        models::agent::Agent,
        models::agent::CreateAgent,
        models::agent::UpdateAgent,
        models::action::AgentAction,
        models::action::CreateAction,
        models::action::UpdateAction,
        models::action::LeadSubmission,
        models::action::SubmitLead,
        models::knowledge::KnowledgeItem,
        models::knowledge::UpdateKnowledgeItem,
        models::conversation::Conversation,
        models::conversation::NewConversation,
        models::message::Message,
        models::message::NewMessage,
        models::widget::Widget,
        models::widget::CreateWidget,
        models::widget::UpdateWidget,
        models::review::ReviewForm,
        models::review::ReviewSubmission,
        models::review::ReviewAnalytics,
        ingest::SubmissionForm,
        ingest::crawl::CrawlTarget,
        ingest::crawl::CommitRequest,
        context::SessionInfo,
        types::CheckoutRequest,
        types::InviteRequest,
        types::AddMemberRequest,
    ))
)]
pub struct ApiDoc;

#[get("/openapi.json")]
async fn openapi_json() -> web::Json<utoipa::openapi::OpenApi> {
    web::Json(ApiDoc::openapi())
}

/// Registers every route on the given service config.
pub fn configure(
    state: Arc<AppState>,
) -> impl FnOnce(&mut web::ServiceConfig) + Send + Clone + 'static {
    move |cfg: &mut web::ServiceConfig| {
        let keys = state.keys.clone();
        let dashboard_url = state.config.dashboard_url.clone();

        cfg.app_data(web::Data::new(state))
            .service(openapi_json)
            .service(Scalar::with_url("/docs", ApiDoc::openapi()))
            .service(
                web::scope("")
                    .wrap(Authentication { keys })
                    .wrap(
                        Cors::default()
                            .allowed_origin(&dashboard_url)
                            .allow_any_method()
                            .allowed_headers(vec![header::AUTHORIZATION, header::CONTENT_TYPE])
                            .supports_credentials()
                            .max_age(3600),
                    )
                    .configure(routes::configure),
            );
    }
}
