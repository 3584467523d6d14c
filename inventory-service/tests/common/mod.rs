#![allow(dead_code)]

use axum::http::HeaderMap;
use chrono::Utc;
use inventory_service::api::AppState;
use inventory_service::clock::{Clock, ManualClock};
use inventory_service::config::ServiceConfig;
use inventory_service::webhooks::{stripe, InboundWebhook, WebhookSecrets};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

pub const STRIPE_SECRET: &str = "whsec_integration";
pub const HOTTOK: &str = "hottok-integration";

pub struct TestApp {
    pub state: AppState,
    pub clock: Arc<ManualClock>,
}

pub fn config() -> ServiceConfig {
    ServiceConfig {
        secrets: WebhookSecrets {
            stripe: Some(STRIPE_SECRET.to_string()),
            hotmart: Some(HOTTOK.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn app() -> TestApp {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let state = AppState::in_memory(&config(), clock.clone());
    TestApp { state, clock }
}

impl TestApp {
    pub async fn product(&self, quantity: i32) -> Uuid {
        let product_id = Uuid::new_v4();
        self.state.ledger.register(product_id, quantity).await.unwrap();
        product_id
    }

    pub async fn available(&self, product_id: Uuid) -> i32 {
        self.state.ledger.get_available(product_id).await.unwrap()
    }

    pub async fn movement_count(&self, product_id: Uuid) -> usize {
        self.state.ledger.movements(product_id).await.unwrap().len()
    }

    /// A Stripe delivery signed at the clock's current time.
    pub fn stripe_delivery(&self, payload: &Value) -> InboundWebhook {
        let body = serde_json::to_vec(payload).unwrap();
        let now = self.clock.now();
        let mut headers = HeaderMap::new();
        headers.insert(
            stripe::SIGNATURE_HEADER,
            stripe::sign(STRIPE_SECRET, now.timestamp(), &body).parse().unwrap(),
        );
        InboundWebhook::new(body, headers, now)
    }
}

pub fn stripe_event(id: &str, event_type: &str, metadata: Value) -> Value {
    serde_json::json!({
        "id": id,
        "type": event_type,
        "data": {"object": {"id": "pi_test", "metadata": metadata}}
    })
}
