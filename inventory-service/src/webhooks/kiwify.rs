use serde_json::Value;
use shared::WebhookAction;

use super::signature::{hex_digest_eq, hmac_sha1_hex};
use super::{required_text, uuid_at, EventReference, InboundWebhook, ProviderAdapter};
use crate::error::WebhookError;

pub const SIGNATURE_QUERY: &str = "signature";
pub const SIGNATURE_HEADER: &str = "x-kiwify-signature";

/// Kiwify order webhooks. The signature is a hex HMAC-SHA1 of the raw body,
/// sent as the `signature` query parameter (or a header when proxied).
#[derive(Debug, Default, Clone, Copy)]
pub struct KiwifyAdapter;

impl ProviderAdapter for KiwifyAdapter {
    fn name(&self) -> &'static str {
        "kiwify"
    }

    fn verify_signature(&self, webhook: &InboundWebhook, secret: &str) -> bool {
        let received = webhook
            .query
            .get(SIGNATURE_QUERY)
            .map(String::as_str)
            .or_else(|| webhook.header(SIGNATURE_HEADER));

        received.is_some_and(|received| hex_digest_eq(&hmac_sha1_hex(secret.as_bytes(), &webhook.body), received))
    }

    fn extract_event_id(&self, payload: &Value) -> Result<String, WebhookError> {
        let order = required_text(payload, "/order_id")?;
        let event = required_text(payload, "/webhook_event_type")?;
        Ok(format!("{}:{}", order, event))
    }

    fn extract_action(&self, payload: &Value) -> WebhookAction {
        match payload.get("webhook_event_type").and_then(Value::as_str) {
            Some("order_approved") => WebhookAction::PurchaseApproved,
            Some("order_refunded" | "chargeback") => WebhookAction::PurchaseRefunded,
            Some("subscription_canceled") => WebhookAction::SubscriptionCancelled,
            _ => WebhookAction::Unknown,
        }
    }

    fn extract_reference(&self, payload: &Value) -> EventReference {
        EventReference {
            reservation_id: uuid_at(payload, "/TrackingParameters/sck"),
            order_id: uuid_at(payload, "/TrackingParameters/src"),
            ..Default::default()
        }
    }
}
