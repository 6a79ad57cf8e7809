use std::sync::Arc;

use actix_web::{post, web, HttpRequest, HttpResponse};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::models::workspace::{Plan, SubscriptionStatus, Workspace, WorkspaceSubscription};
use crate::types::StripeEvent;
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Seconds a signed event stays acceptable.
const TOLERANCE_SECS: i64 = 300;

/// Checks a `Stripe-Signature` header (`t=<unix secs>,v1=<hex hmac>,...`)
/// against the raw body.
pub fn verify_signature(secret: &str, header: &str, body: &[u8], now: i64) -> AppResult<()> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| AppError::Unauthorized("Invalid timestamp part".to_string()))?;
    if signatures.is_empty() {
        return Err(AppError::Unauthorized("Invalid signature part".to_string()));
    }

    let issued = timestamp
        .parse::<i64>()
        .map_err(|_| AppError::Unauthorized("Invalid timestamp".to_string()))?;
    if issued + TOLERANCE_SECS < now {
        return Err(AppError::Unauthorized("Timestamp is too old".to_string()));
    }

    let body = std::str::from_utf8(body)
        .map_err(|_| AppError::Validation("Invalid body format".to_string()))?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AppError::Internal(anyhow::anyhow!("HMAC initialization error")))?;
    mac.update(format!("{}.{}", timestamp, body).as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    if !signatures.iter().any(|s| *s == expected) {
        return Err(AppError::Unauthorized("Invalid signature".to_string()));
    }
    Ok(())
}

fn parse_plan(value: Option<&Value>) -> Plan {
    value
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or(Plan::Pro)
}

fn map_status(status: &str) -> SubscriptionStatus {
    match status {
        "active" => SubscriptionStatus::Active,
        "trialing" => SubscriptionStatus::Trial,
        "canceled" => SubscriptionStatus::Cancelled,
        _ => SubscriptionStatus::Expired,
    }
}

fn customer_id(object: &Value) -> Option<String> {
    object.get("customer").and_then(Value::as_str).map(str::to_string)
}

/// Works out which workspace an event concerns and what its subscription
/// becomes. `None` for events that carry no workspace.
pub fn subscription_change(event: &StripeEvent) -> Option<(String, WorkspaceSubscription)> {
    let object = &event.data.object;
    let metadata = object.get("metadata");
    let meta = |key: &str| metadata.and_then(|m| m.get(key));

    match event.kind.as_str() {
        "checkout.session.completed" => {
            let workspace_id = object
                .get("client_reference_id")
                .and_then(Value::as_str)
                .or_else(|| meta("workspace_id").and_then(Value::as_str))?;
            Some((
                workspace_id.to_string(),
                WorkspaceSubscription {
                    plan: parse_plan(meta("plan")),
                    status: SubscriptionStatus::Active,
                    stripe_customer_id: customer_id(object),
                    expires_at: None,
                },
            ))
        }
        "customer.subscription.updated" | "customer.subscription.deleted" => {
            let workspace_id = meta("workspace_id").and_then(Value::as_str)?;
            let expires_at = object
                .get("current_period_end")
                .and_then(Value::as_i64)
                .map(|secs| secs * 1000);
            let subscription = if event.kind == "customer.subscription.deleted" {
                WorkspaceSubscription {
                    plan: Plan::Free,
                    status: SubscriptionStatus::Cancelled,
                    stripe_customer_id: customer_id(object),
                    expires_at,
                }
            } else {
                WorkspaceSubscription {
                    plan: parse_plan(meta("plan")),
                    status: map_status(object.get("status").and_then(Value::as_str).unwrap_or_default()),
                    stripe_customer_id: customer_id(object),
                    expires_at,
                }
            };
            Some((workspace_id.to_string(), subscription))
        }
        _ => None,
    }
}

#[post("/stripe")]
pub async fn stripe_webhook(
    app_state: web::Data<Arc<AppState>>,
    req: HttpRequest,
    body: web::Bytes,
) -> AppResult<HttpResponse> {
    let secret = app_state
        .config
        .stripe_webhook_secret
        .as_deref()
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Stripe webhook secret not set")))?;
    let signature = req
        .headers()
        .get("Stripe-Signature")
        .ok_or_else(|| AppError::Unauthorized("Missing signature".to_string()))?
        .to_str()
        .map_err(|_| AppError::Unauthorized("Invalid signature format".to_string()))?;

    verify_signature(secret, signature, &body, Utc::now().timestamp())?;

    let event: StripeEvent = serde_json::from_slice(&body)
        .map_err(|_| AppError::Validation("Invalid JSON body".to_string()))?;
    debug!("Stripe event {} ({})", event.id, event.kind);

    match subscription_change(&event) {
        Some((workspace_id, subscription)) => {
            let store = app_state.store.as_ref();
            if Workspace::get(store, &workspace_id).await?.is_none() {
                warn!("Stripe event {} names unknown workspace {}", event.id, workspace_id);
            } else {
                Workspace::set_subscription(store, &workspace_id, &subscription).await?;
                info!("Applied {} to workspace {}", event.kind, workspace_id);
            }
        }
        None => debug!("Ignoring Stripe event {}", event.kind),
    }

    Ok(HttpResponse::Ok().finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sign(secret: &str, timestamp: i64, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, body).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_a_fresh_valid_signature() {
        let body = r#"{"id":"evt_1"}"#;
        let header = sign("whsec", 1_700_000_000, body);
        assert!(verify_signature("whsec", &header, body.as_bytes(), 1_700_000_010).is_ok());
    }

    #[test]
    fn rejects_tampered_and_stale_events() {
        let body = r#"{"id":"evt_1"}"#;
        let header = sign("whsec", 1_700_000_000, body);
        assert!(matches!(
            verify_signature("whsec", &header, br#"{"id":"evt_2"}"#, 1_700_000_010),
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            verify_signature("whsec", &header, body.as_bytes(), 1_700_000_000 + 301),
            Err(AppError::Unauthorized(_))
        ));
        assert!(verify_signature("whsec", "v1=abc", body.as_bytes(), 0).is_err());
    }

    fn event(kind: &str, object: Value) -> StripeEvent {
        serde_json::from_value(json!({ "id": "evt", "type": kind, "data": { "object": object } })).unwrap()
    }

    #[test]
    fn checkout_completion_activates_the_plan() {
        let (workspace_id, subscription) = subscription_change(&event(
            "checkout.session.completed",
            json!({ "client_reference_id": "w1", "customer": "cus_1", "metadata": { "plan": "enterprise" } }),
        ))
        .unwrap();
        assert_eq!(workspace_id, "w1");
        assert_eq!(subscription.plan, Plan::Enterprise);
        assert_eq!(subscription.status, SubscriptionStatus::Active);
        assert_eq!(subscription.stripe_customer_id.as_deref(), Some("cus_1"));
    }

    #[test]
    fn subscription_lifecycle_events() {
        let (_, updated) = subscription_change(&event(
            "customer.subscription.updated",
            json!({ "status": "past_due", "current_period_end": 10, "metadata": { "workspace_id": "w1", "plan": "pro" } }),
        ))
        .unwrap();
        assert_eq!(updated.status, SubscriptionStatus::Expired);
        assert_eq!(updated.expires_at, Some(10_000));

        let (_, deleted) = subscription_change(&event(
            "customer.subscription.deleted",
            json!({ "metadata": { "workspace_id": "w1" } }),
        ))
        .unwrap();
        assert_eq!(deleted.plan, Plan::Free);
        assert_eq!(deleted.status, SubscriptionStatus::Cancelled);

        assert!(subscription_change(&event("invoice.paid", json!({}))).is_none());
    }
}
