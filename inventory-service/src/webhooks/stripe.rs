use chrono::Duration;
use serde_json::Value;
use shared::WebhookAction;

use super::signature::{hex_digest_eq, hmac_sha256_hex};
use super::{required_text, EventReference, InboundWebhook, ProviderAdapter};
use crate::error::WebhookError;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Stripe events. `Stripe-Signature: t=<unix>,v1=<hex>` is an HMAC-SHA256
/// of `"<t>.<raw body>"`; deliveries outside the tolerance window are refused
/// to bound replay.
#[derive(Debug, Clone, Copy)]
pub struct StripeAdapter {
    tolerance: Duration,
}

impl StripeAdapter {
    pub fn new(tolerance: Duration) -> Self {
        Self { tolerance }
    }
}

impl Default for StripeAdapter {
    fn default() -> Self {
        Self::new(Duration::minutes(5))
    }
}

struct SignatureHeader<'a> {
    timestamp: i64,
    signatures: Vec<&'a str>,
}

fn parse_header(header: &str) -> Option<SignatureHeader<'_>> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    Some(SignatureHeader {
        timestamp: timestamp?,
        signatures,
    })
}

/// Header value Stripe would send for `body` at `timestamp`.
pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
    format!("t={},v1={}", timestamp, hmac_sha256_hex(secret.as_bytes(), &signed_payload(timestamp, body)))
}

fn signed_payload(timestamp: i64, body: &[u8]) -> Vec<u8> {
    let mut payload = format!("{}.", timestamp).into_bytes();
    payload.extend_from_slice(body);
    payload
}

impl ProviderAdapter for StripeAdapter {
    fn name(&self) -> &'static str {
        "stripe"
    }

    fn verify_signature(&self, webhook: &InboundWebhook, secret: &str) -> bool {
        let Some(header) = webhook.header(SIGNATURE_HEADER).and_then(parse_header) else {
            return false;
        };

        let skew = webhook.received_at.timestamp().abs_diff(header.timestamp);
        if skew > self.tolerance.num_seconds().unsigned_abs() {
            return false;
        }

        let expected = hmac_sha256_hex(secret.as_bytes(), &signed_payload(header.timestamp, &webhook.body));
        header.signatures.iter().any(|candidate| hex_digest_eq(&expected, candidate))
    }

    fn extract_event_id(&self, payload: &Value) -> Result<String, WebhookError> {
        required_text(payload, "/id")
    }

    fn extract_action(&self, payload: &Value) -> WebhookAction {
        match payload.get("type").and_then(Value::as_str) {
            Some("payment_intent.succeeded" | "checkout.session.completed") => WebhookAction::PurchaseApproved,
            Some("charge.refunded" | "payment_intent.canceled") => WebhookAction::PurchaseRefunded,
            Some("customer.subscription.deleted") => WebhookAction::SubscriptionCancelled,
            _ => WebhookAction::Unknown,
        }
    }

    fn extract_reference(&self, payload: &Value) -> EventReference {
        payload
            .pointer("/data/object/metadata")
            .map(EventReference::from_metadata)
            .unwrap_or_default()
    }
}
