use serde_json::Value;
use shared::WebhookAction;

use super::signature::{hex_digest_eq, sha256_hex};
use super::{required_text, uuid_at, EventReference, InboundWebhook, ProviderAdapter};
use crate::error::WebhookError;

pub const SIGNATURE_HEADER: &str = "x-authenticity-token";

/// PagSeguro order notifications. The authenticity token is the hex SHA-256
/// of `"<account token>-<raw body>"`. One order is notified once per charge
/// status, so the charge id and status together identify the event.
#[derive(Debug, Default, Clone, Copy)]
pub struct PagSeguroAdapter;

pub fn authenticity_token(token: &str, body: &[u8]) -> String {
    let mut message = format!("{}-", token).into_bytes();
    message.extend_from_slice(body);
    sha256_hex(&message)
}

impl ProviderAdapter for PagSeguroAdapter {
    fn name(&self) -> &'static str {
        "pagseguro"
    }

    fn verify_signature(&self, webhook: &InboundWebhook, secret: &str) -> bool {
        webhook
            .header(SIGNATURE_HEADER)
            .is_some_and(|received| hex_digest_eq(&authenticity_token(secret, &webhook.body), received))
    }

    fn extract_event_id(&self, payload: &Value) -> Result<String, WebhookError> {
        let charge = required_text(payload, "/charges/0/id")?;
        let status = required_text(payload, "/charges/0/status")?;
        Ok(format!("{}:{}", charge, status))
    }

    fn extract_action(&self, payload: &Value) -> WebhookAction {
        match payload.pointer("/charges/0/status").and_then(Value::as_str) {
            Some("PAID") => WebhookAction::PurchaseApproved,
            Some("CANCELED") => WebhookAction::PurchaseRefunded,
            _ => WebhookAction::Unknown,
        }
    }

    fn extract_reference(&self, payload: &Value) -> EventReference {
        let from_order = EventReference {
            order_id: uuid_at(payload, "/reference_id"),
            ..Default::default()
        };
        let metadata = payload
            .get("metadata")
            .or_else(|| payload.pointer("/charges/0/metadata"))
            .map(EventReference::from_metadata)
            .unwrap_or_default();
        from_order.or(metadata)
    }
}
