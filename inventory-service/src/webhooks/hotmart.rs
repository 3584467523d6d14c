use serde_json::Value;
use shared::WebhookAction;

use super::signature::constant_time_eq;
use super::{required_text, uuid_at, EventReference, InboundWebhook, ProviderAdapter};
use crate::error::WebhookError;

pub const HOTTOK_HEADER: &str = "x-hotmart-hottok";

/// Hotmart postback (v2). Authenticated by the account's static hottok.
#[derive(Debug, Default, Clone, Copy)]
pub struct HotmartAdapter;

impl ProviderAdapter for HotmartAdapter {
    fn name(&self) -> &'static str {
        "hotmart"
    }

    fn verify_signature(&self, webhook: &InboundWebhook, secret: &str) -> bool {
        webhook
            .header(HOTTOK_HEADER)
            .is_some_and(|hottok| !secret.is_empty() && constant_time_eq(hottok.as_bytes(), secret.as_bytes()))
    }

    fn extract_event_id(&self, payload: &Value) -> Result<String, WebhookError> {
        required_text(payload, "/id")
    }

    fn extract_action(&self, payload: &Value) -> WebhookAction {
        match payload.get("event").and_then(Value::as_str) {
            Some("PURCHASE_APPROVED" | "PURCHASE_COMPLETE") => WebhookAction::PurchaseApproved,
            Some("PURCHASE_REFUNDED" | "PURCHASE_CHARGEBACK" | "PURCHASE_CANCELED") => WebhookAction::PurchaseRefunded,
            Some("SUBSCRIPTION_CANCELLATION") => WebhookAction::SubscriptionCancelled,
            _ => WebhookAction::Unknown,
        }
    }

    /// Checkout tracking: `xcod` carries the order id, `sck` the reservation id.
    fn extract_reference(&self, payload: &Value) -> EventReference {
        EventReference {
            reservation_id: uuid_at(payload, "/data/purchase/origin/sck"),
            order_id: uuid_at(payload, "/data/purchase/origin/xcod"),
            ..Default::default()
        }
    }
}
