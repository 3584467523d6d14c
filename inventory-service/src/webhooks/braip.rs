use serde_json::Value;
use shared::WebhookAction;

use super::signature::constant_time_eq;
use super::{required_text, EventReference, InboundWebhook, ProviderAdapter};
use crate::error::WebhookError;

/// Braip postbacks. The account token travels inside the payload as
/// `basic_authentication`; each status change of a transaction is a separate event.
#[derive(Debug, Default, Clone, Copy)]
pub struct BraipAdapter;

impl ProviderAdapter for BraipAdapter {
    fn name(&self) -> &'static str {
        "braip"
    }

    fn verify_signature(&self, webhook: &InboundWebhook, secret: &str) -> bool {
        let Ok(payload) = webhook.json() else {
            return false;
        };

        payload
            .get("basic_authentication")
            .and_then(Value::as_str)
            .is_some_and(|token| !secret.is_empty() && constant_time_eq(token.as_bytes(), secret.as_bytes()))
    }

    fn extract_event_id(&self, payload: &Value) -> Result<String, WebhookError> {
        let transaction = required_text(payload, "/trans_key")?;
        let status = required_text(payload, "/trans_status_code")?;
        Ok(format!("{}:{}", transaction, status))
    }

    fn extract_action(&self, payload: &Value) -> WebhookAction {
        if payload.get("type").and_then(Value::as_str) == Some("ASSINATURA_CANCELADA") {
            return WebhookAction::SubscriptionCancelled;
        }

        match payload.get("trans_status").and_then(Value::as_str) {
            Some("Pagamento Aprovado") => WebhookAction::PurchaseApproved,
            Some("Cancelada" | "Devolvida" | "Chargeback") => WebhookAction::PurchaseRefunded,
            _ => WebhookAction::Unknown,
        }
    }

    fn extract_reference(&self, payload: &Value) -> EventReference {
        payload
            .get("meta")
            .map(EventReference::from_metadata)
            .unwrap_or_default()
    }
}
