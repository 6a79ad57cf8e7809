use std::collections::BTreeMap;

use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

/// Transactional emails the dashboard sends.
#[derive(Debug, Clone, PartialEq)]
pub enum Email {
    Welcome {
        email: String,
        name: String,
    },
    TeamInvite {
        email: String,
        inviter_name: String,
        workspace_name: String,
        invite_link: String,
    },
    ArticleProcessed {
        email: String,
        user_name: Option<String>,
        article_title: String,
        article_type: String,
        agent_name: Option<String>,
        chunks_count: Option<u64>,
    },
    ConversationReply {
        email: String,
        customer_name: String,
        agent_name: String,
        reply: String,
    },
    LeadCollected {
        email: String,
        user_name: String,
        lead_name: String,
        lead_email: String,
        lead_data: BTreeMap<String, String>,
        dashboard_link: String,
    },
    AgentDeployed {
        email: String,
        user_name: String,
        agent_name: String,
        dashboard_link: String,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionalRequest<'a> {
    transactional_id: &'a str,
    email: &'a str,
    data_variables: Value,
}

impl Email {
    fn template(&self) -> &'static str {
        match self {
            Email::Welcome { .. } => "welcome",
            Email::TeamInvite { .. } => "team-invite",
            Email::ArticleProcessed { .. } => "article-processed",
            Email::ConversationReply { .. } => "conversation-reply",
            Email::LeadCollected { .. } => "lead-collected",
            Email::AgentDeployed { .. } => "agent-deployed",
        }
    }

    fn recipient(&self) -> &str {
        match self {
            Email::Welcome { email, .. }
            | Email::TeamInvite { email, .. }
            | Email::ArticleProcessed { email, .. }
            | Email::ConversationReply { email, .. }
            | Email::LeadCollected { email, .. }
            | Email::AgentDeployed { email, .. } => email,
        }
    }

    fn variables(&self) -> Value {
        match self {
            Email::Welcome { name, .. } => json!({ "name": name }),
            Email::TeamInvite {
                inviter_name,
                workspace_name,
                invite_link,
                ..
            } => json!({
                "inviterName": inviter_name,
                "companyName": workspace_name,
                "inviteLink": invite_link,
            }),
            Email::ArticleProcessed {
                user_name,
                article_title,
                article_type,
                agent_name,
                chunks_count,
                ..
            } => json!({
                "userName": user_name.clone().unwrap_or_default(),
                "articleTitle": article_title,
                "articleType": article_type,
                "widgetName": agent_name.clone().unwrap_or_default(),
                "chunksCount": chunks_count.unwrap_or(0),
            }),
            Email::ConversationReply {
                customer_name,
                agent_name,
                reply,
                ..
            } => json!({
                "customerName": customer_name,
                "agentName": agent_name,
                "reply": reply,
            }),
            Email::LeadCollected {
                user_name,
                lead_name,
                lead_email,
                lead_data,
                dashboard_link,
                ..
            } => json!({
                "userName": user_name,
                "leadName": lead_name,
                "leadEmail": lead_email,
                "leadData": lead_data
                    .iter()
                    .map(|(field, value)| format!("{}: {}", field, value))
                    .collect::<Vec<_>>()
                    .join("\n"),
                "dashboardLink": dashboard_link,
            }),
            Email::AgentDeployed {
                user_name,
                agent_name,
                dashboard_link,
                ..
            } => json!({
                "userName": user_name,
                "agentName": agent_name,
                "dashboardLink": dashboard_link,
            }),
        }
    }
}

/// Best-effort sender over the Loops transactional API. Failures are
/// logged and never returned to the caller.
#[derive(Clone)]
pub struct Notifier {
    client: Client,
    api_url: String,
    api_key: Option<String>,
}

impl Notifier {
    pub fn new(api_url: &str, api_key: Option<String>) -> Self {
        Notifier {
            client: Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Returns whether the provider accepted the email.
    pub async fn send(&self, email: Email) -> bool {
        let Some(api_key) = &self.api_key else {
            debug!("Email API key not configured, skipping {} email", email.template());
            return false;
        };

        let request = TransactionalRequest {
            transactional_id: email.template(),
            email: email.recipient(),
            data_variables: email.variables(),
        };

        let response = self
            .client
            .post(format!("{}/transactional", self.api_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&request)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                info!("Sent {} email to {}", email.template(), email.recipient());
                true
            }
            Ok(response) => {
                warn!(
                    "Email provider rejected {} email: {}",
                    email.template(),
                    response.status()
                );
                false
            }
            Err(e) => {
                error!("Failed to send {} email: {:?}", email.template(), e);
                false
            }
        }
    }
}
