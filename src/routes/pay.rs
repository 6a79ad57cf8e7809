use std::collections::HashMap;
use std::sync::Arc;

use actix_web::{post, web};
use anyhow::anyhow;
use stripe::generated::checkout::checkout_session;
use stripe::{
    CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionSubscriptionData,
};
use tracing::{error, info};

use crate::context::WorkspaceScope;
use crate::error::{AppError, AppResult};
use crate::models::workspace::Plan;
use crate::types::{CheckoutRequest, CheckoutResponse};
use crate::{AppConfig, AppState};

fn price_for(config: &AppConfig, plan: Plan) -> AppResult<String> {
    let price = match plan {
        Plan::Free => {
            return Err(AppError::Validation(
                "The free plan does not need a checkout".to_string(),
            ))
        }
        Plan::Pro => config.stripe_price_pro.clone(),
        Plan::Enterprise => config.stripe_price_enterprise.clone(),
    };
    price.ok_or_else(|| AppError::Internal(anyhow!("No Stripe price configured for {:?}", plan)))
}

/// Opens a Stripe checkout for the workspace. The workspace id and plan
/// travel in the session and subscription metadata so the webhook can
/// attribute the payment.
#[post("/billing/checkout")]
async fn checkout(
    app_state: web::Data<Arc<AppState>>,
    scope: WorkspaceScope,
    web::Json(request): web::Json<CheckoutRequest>,
) -> AppResult<web::Json<CheckoutResponse>> {
    scope.require_manager()?;
    let client = app_state
        .stripe_client
        .as_ref()
        .ok_or_else(|| AppError::Internal(anyhow!("Billing is not configured")))?;
    let price = price_for(&app_state.config, request.plan)?;

    let plan = serde_json::to_value(request.plan)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    let metadata: HashMap<String, String> = HashMap::from([
        ("workspace_id".to_string(), scope.id().to_string()),
        ("plan".to_string(), plan),
    ]);

    let billing_url = format!(
        "{}/w/{}/settings/billing",
        app_state.config.dashboard_url, scope.workspace.url
    );
    let success_url = format!("{}?checkout=success", billing_url);
    let cancel_url = format!("{}?checkout=cancelled", billing_url);

    let line_item = CreateCheckoutSessionLineItems {
        price: Some(price),
        quantity: Some(1),
        ..Default::default()
    };

    let params = CreateCheckoutSession {
        customer_email: scope.user.email.as_str().into(),
        client_reference_id: scope.id().into(),
        line_items: vec![line_item].into(),
        metadata: Some(metadata.clone()),
        subscription_data: Some(CreateCheckoutSessionSubscriptionData {
            metadata: Some(metadata),
            ..Default::default()
        }),
        mode: CheckoutSessionMode::Subscription.into(),
        success_url: success_url.as_str().into(),
        cancel_url: cancel_url.as_str().into(),
        ..Default::default()
    };

    let session = checkout_session::CheckoutSession::create(client, params)
        .await
        .map_err(|e| {
            error!("Failed to create checkout session: {:?}", e);
            AppError::Backend(e.to_string())
        })?;

    let url = session
        .url
        .ok_or_else(|| AppError::Backend("Stripe returned no checkout URL".to_string()))?;
    info!("Created {:?} checkout for workspace {}", request.plan, scope.id());
    Ok(web::Json(CheckoutResponse { url }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(checkout);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_lookup_by_plan() {
        let mut config = AppConfig::local("http://127.0.0.1:9", "secret");
        config.stripe_price_pro = Some("price_pro".to_string());

        assert_eq!(price_for(&config, Plan::Pro).unwrap(), "price_pro");
        assert!(matches!(
            price_for(&config, Plan::Free),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            price_for(&config, Plan::Enterprise),
            Err(AppError::Internal(_))
        ));
    }
}
