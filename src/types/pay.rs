use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::models::workspace::Plan;

#[derive(Serialize, Deserialize, Clone, ToSchema)]
pub struct CheckoutRequest {
    pub plan: Plan,
}

#[derive(Serialize, Deserialize, Clone, ToSchema)]
pub struct CheckoutResponse {
    pub url: String,
}

/// The parts of a Stripe event the webhook reads.
#[derive(Deserialize, Debug)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: StripeEventData,
}

#[derive(Deserialize, Debug)]
pub struct StripeEventData {
    pub object: Value,
}
