pub mod actions;
pub mod agents;
pub mod auth;
pub mod conversations;
pub mod crawl;
pub mod knowledge;
pub mod notion;
pub mod pay;
pub mod reviews;
pub mod webhook;
pub mod widgets;
pub mod workspaces;

use actix_web::web;
use serde::Serialize;

/// `{ "success": true, ... }` envelope shared by mutating endpoints.
#[derive(Serialize)]
pub struct Ack {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Ack {
            success: true,
            message: None,
            warning: None,
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Ack {
            message: Some(message.into()),
            ..Ack::ok()
        }
    }

    pub fn warning(message: impl Into<String>, warning: impl Into<String>) -> Self {
        Ack {
            message: Some(message.into()),
            warning: Some(warning.into()),
            ..Ack::ok()
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::scope("/auth").configure(auth::configure))
        .service(web::scope("/workspaces").configure(workspaces::configure_root))
        .service(workspaces::accept_invite)
        .service(
            web::scope("/public")
                .configure(reviews::configure_public)
                .configure(actions::configure_public),
        )
        .service(web::scope("/webhooks").service(webhook::stripe_webhook))
        .service(
            web::scope("/w/{workspace}")
                .configure(workspaces::configure_scoped)
                .configure(agents::configure)
                .configure(actions::configure)
                .configure(knowledge::configure)
                .configure(crawl::configure)
                .configure(notion::configure)
                .configure(conversations::configure)
                .configure(widgets::configure)
                .configure(reviews::configure)
                .configure(pay::configure),
        );
}
