//! Webhook ingress: per-provider adapters that authenticate a delivery and
//! reduce its payload to a stable event key, a business action and the
//! inventory references the action applies to.

use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use shared::WebhookAction;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::WebhookError;

pub mod braip;
pub mod hotmart;
pub mod kiwify;
pub mod pagseguro;
pub mod signature;
pub mod stripe;

pub use braip::BraipAdapter;
pub use hotmart::HotmartAdapter;
pub use kiwify::KiwifyAdapter;
pub use pagseguro::PagSeguroAdapter;
pub use stripe::StripeAdapter;

/// A delivery as received, before any parsing. The raw body is kept because
/// every signature scheme is computed over the exact bytes sent.
#[derive(Debug, Clone)]
pub struct InboundWebhook {
    pub body: Vec<u8>,
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
    pub received_at: DateTime<Utc>,
}

impl InboundWebhook {
    pub fn new(body: impl Into<Vec<u8>>, headers: HeaderMap, received_at: DateTime<Utc>) -> Self {
        Self {
            body: body.into(),
            headers,
            query: HashMap::new(),
            received_at,
        }
    }

    pub fn with_query(mut self, query: HashMap<String, String>) -> Self {
        self.query = query;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn json(&self) -> Result<Value, WebhookError> {
        serde_json::from_slice(&self.body).map_err(|e| WebhookError::InvalidPayload(e.to_string()))
    }
}

/// Inventory identifiers a provider carried in its metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventReference {
    pub reservation_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub product_id: Option<Uuid>,
    pub quantity: Option<i32>,
}

impl EventReference {
    /// Reads `reservation_id`, `order_id`, `product_id` and `quantity` from a
    /// flat metadata object. Values may be strings or numbers.
    pub fn from_metadata(metadata: &Value) -> Self {
        Self {
            reservation_id: uuid_at(metadata, "/reservation_id"),
            order_id: uuid_at(metadata, "/order_id"),
            product_id: uuid_at(metadata, "/product_id"),
            quantity: quantity_at(metadata, "/quantity"),
        }
    }

    /// Fills fields still unset from `other`.
    pub fn or(self, other: EventReference) -> Self {
        Self {
            reservation_id: self.reservation_id.or(other.reservation_id),
            order_id: self.order_id.or(other.order_id),
            product_id: self.product_id.or(other.product_id),
            quantity: self.quantity.or(other.quantity),
        }
    }
}

pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn verify_signature(&self, webhook: &InboundWebhook, secret: &str) -> bool;

    fn extract_event_id(&self, payload: &Value) -> Result<String, WebhookError>;

    fn extract_action(&self, payload: &Value) -> WebhookAction;

    fn extract_reference(&self, payload: &Value) -> EventReference;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEvent {
    pub provider: String,
    pub native_id: String,
    pub event_key: String,
    pub action: WebhookAction,
    pub reference: EventReference,
}

pub fn event_key(provider: &str, native_id: &str) -> String {
    format!("{}:{}", provider, native_id)
}

/// Secrets per provider. A provider left as `None` is not registered.
#[derive(Debug, Clone, Default)]
pub struct WebhookSecrets {
    pub stripe: Option<String>,
    pub pagseguro: Option<String>,
    pub hotmart: Option<String>,
    pub kiwify: Option<String>,
    pub braip: Option<String>,
}

struct Registered {
    adapter: Box<dyn ProviderAdapter>,
    secret: String,
}

#[derive(Default)]
pub struct WebhookNormalizer {
    providers: HashMap<&'static str, Registered>,
}

impl WebhookNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_secrets(secrets: &WebhookSecrets, stripe_tolerance: Duration) -> Self {
        let mut normalizer = Self::new();
        if let Some(secret) = &secrets.stripe {
            normalizer = normalizer.register(StripeAdapter::new(stripe_tolerance), secret.clone());
        }
        if let Some(secret) = &secrets.pagseguro {
            normalizer = normalizer.register(PagSeguroAdapter, secret.clone());
        }
        if let Some(secret) = &secrets.hotmart {
            normalizer = normalizer.register(HotmartAdapter, secret.clone());
        }
        if let Some(secret) = &secrets.kiwify {
            normalizer = normalizer.register(KiwifyAdapter, secret.clone());
        }
        if let Some(secret) = &secrets.braip {
            normalizer = normalizer.register(BraipAdapter, secret.clone());
        }
        normalizer
    }

    pub fn register(mut self, adapter: impl ProviderAdapter + 'static, secret: impl Into<String>) -> Self {
        self.providers.insert(
            adapter.name(),
            Registered {
                adapter: Box::new(adapter),
                secret: secret.into(),
            },
        );
        self
    }

    pub fn providers(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.providers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Authenticates the delivery, then extracts its key, action and references.
    /// Nothing past the signature check runs for an unauthenticated delivery.
    pub fn normalize(&self, provider: &str, webhook: &InboundWebhook) -> Result<NormalizedEvent, WebhookError> {
        let registered = self
            .providers
            .get(provider)
            .ok_or_else(|| WebhookError::UnknownProvider(provider.to_string()))?;
        let adapter = registered.adapter.as_ref();

        if !adapter.verify_signature(webhook, &registered.secret) {
            warn!(
                security_event = true,
                provider,
                body_len = webhook.body.len(),
                "Rejected webhook with invalid signature"
            );
            return Err(WebhookError::SignatureInvalid(provider.to_string()));
        }

        let payload = webhook.json()?;
        let native_id = adapter.extract_event_id(&payload)?;
        let action = adapter.extract_action(&payload);
        let reference = adapter.extract_reference(&payload);
        let event_key = event_key(adapter.name(), &native_id);

        debug!(%event_key, ?action, ?reference, "Normalized webhook");
        Ok(NormalizedEvent {
            provider: adapter.name().to_string(),
            native_id,
            event_key,
            action,
            reference,
        })
    }
}

/// String at `pointer`, accepting numbers as their decimal text.
pub(crate) fn text_at(payload: &Value, pointer: &str) -> Option<String> {
    match payload.pointer(pointer)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn required_text(payload: &Value, pointer: &str) -> Result<String, WebhookError> {
    text_at(payload, pointer).ok_or_else(|| WebhookError::InvalidPayload(format!("missing {}", pointer)))
}

pub(crate) fn uuid_at(payload: &Value, pointer: &str) -> Option<Uuid> {
    text_at(payload, pointer).and_then(|s| Uuid::parse_str(s.trim()).ok())
}

pub(crate) fn quantity_at(payload: &Value, pointer: &str) -> Option<i32> {
    let quantity: Option<i32> = match payload.pointer(pointer)? {
        Value::Number(n) => n.as_i64().and_then(|q| i32::try_from(q).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    quantity.filter(|q| *q > 0)
}
