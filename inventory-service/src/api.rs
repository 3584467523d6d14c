use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use shared::*;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::ServiceConfig;
use crate::error::{InventoryError, ProcessError, WebhookError};
use crate::idempotency::{IdempotencyStore, InMemoryIdempotencyStore, PgIdempotencyStore};
use crate::ledger::{ReconciliationReport, StockLedger};
use crate::notify::{StockObserver, TracingObserver};
use crate::processor::{EventProcessor, ProcessOutcome};
use crate::reservations::ReservationManager;
use crate::store::postgres::DbPool;
use crate::store::{InMemoryInventoryStore, InventoryStore, PgInventoryStore, StockAdjustment};
use crate::sweeper::Sweeper;
use crate::webhooks::{InboundWebhook, WebhookNormalizer};

#[derive(Clone)]
pub struct AppState {
    pub ledger: StockLedger,
    pub reservations: ReservationManager,
    pub processor: EventProcessor,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn build(
        store: Arc<dyn InventoryStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        observer: Arc<dyn StockObserver>,
        clock: Arc<dyn Clock>,
        config: &ServiceConfig,
    ) -> Self {
        let ledger = StockLedger::new(store.clone(), clock.clone(), observer.clone(), config.low_stock_threshold);
        let reservations = ReservationManager::new(
            store,
            ledger.clone(),
            clock.clone(),
            observer,
            config.reservation_ttl,
            config.sweep_batch_size,
        );
        let normalizer = Arc::new(WebhookNormalizer::from_secrets(&config.secrets, config.stripe_tolerance));
        let processor = EventProcessor::new(normalizer, idempotency.clone(), reservations.clone(), clock.clone());

        Self {
            ledger,
            reservations,
            processor,
            idempotency,
            clock,
        }
    }

    pub fn in_memory(config: &ServiceConfig, clock: Arc<dyn Clock>) -> Self {
        Self::build(
            Arc::new(InMemoryInventoryStore::new()),
            Arc::new(InMemoryIdempotencyStore::new(config.idempotency)),
            Arc::new(TracingObserver),
            clock,
            config,
        )
    }

    pub fn postgres(pool: DbPool, config: &ServiceConfig, clock: Arc<dyn Clock>) -> Self {
        Self::build(
            Arc::new(PgInventoryStore::new(pool.clone())),
            Arc::new(PgIdempotencyStore::new(pool, config.idempotency)),
            Arc::new(TracingObserver),
            clock,
            config,
        )
    }

    pub fn sweeper(&self, interval: std::time::Duration) -> Sweeper {
        Sweeper::new(self.reservations.clone(), self.idempotency.clone(), self.clock.clone(), interval)
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterProductRequest {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
pub struct AdjustStockRequest {
    pub delta: i32,
}

#[derive(Debug, Deserialize)]
pub struct CreateReservationRequest {
    pub product_id: Uuid,
    pub quantity: i32,
    pub order_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<EventSummary>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

pub const RETRY_AFTER_SECS: u64 = 30;

#[derive(Debug)]
pub enum AppError {
    Inventory(InventoryError),
    Process(ProcessError),
    InProgress(String),
}

impl From<InventoryError> for AppError {
    fn from(err: InventoryError) -> Self {
        Self::Inventory(err)
    }
}

impl From<ProcessError> for AppError {
    fn from(err: ProcessError) -> Self {
        Self::Process(err)
    }
}

fn inventory_status(err: &InventoryError) -> (StatusCode, &'static str) {
    match err {
        InventoryError::InsufficientStock { .. } => (StatusCode::CONFLICT, "insufficient_stock"),
        InventoryError::ProductNotFound(_) | InventoryError::ReservationNotFound(_) => {
            (StatusCode::NOT_FOUND, "not_found")
        }
        InventoryError::ProductAlreadyExists(_) => (StatusCode::CONFLICT, "already_exists"),
        InventoryError::AlreadyTerminal { .. } => (StatusCode::CONFLICT, "already_terminal"),
        InventoryError::Expired(_) => (StatusCode::CONFLICT, "expired"),
        InventoryError::NotYetExpired(_) => (StatusCode::CONFLICT, "not_yet_expired"),
        InventoryError::InvalidQuantity(_) => (StatusCode::BAD_REQUEST, "invalid_quantity"),
        InventoryError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage"),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Inventory(err) => {
                let (status, code) = inventory_status(err);
                (status, code, err.to_string())
            }
            AppError::Process(ProcessError::Webhook(err)) => {
                let (status, code) = match err {
                    WebhookError::UnknownProvider(_) => (StatusCode::NOT_FOUND, "unknown_provider"),
                    WebhookError::SignatureInvalid(_) => (StatusCode::UNAUTHORIZED, "signature_invalid"),
                    WebhookError::InvalidPayload(_) => (StatusCode::BAD_REQUEST, "invalid_payload"),
                };
                (status, code, err.to_string())
            }
            AppError::Process(err @ ProcessError::MutationFailed { .. }) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "mutation_failed", err.to_string())
            }
            AppError::Process(err @ ProcessError::Idempotency(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "storage", err.to_string())
            }
            AppError::InProgress(event_key) => (
                StatusCode::CONFLICT,
                "processing_in_progress",
                format!("Event {} is being processed; retry later", event_key),
            ),
        };

        if status.is_server_error() {
            tracing::error!("Request failed: {}", message);
        }

        let body = Json(ErrorResponse { error: message, code });
        match self {
            AppError::InProgress(_) => {
                (status, [(header::RETRY_AFTER, RETRY_AFTER_SECS.to_string())], body).into_response()
            }
            _ => (status, body).into_response(),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/products", post(register_product))
        .route("/products/:id/stock", get(get_stock))
        .route("/products/:id/adjustments", post(adjust_stock))
        .route("/products/:id/movements", get(list_movements))
        .route("/products/:id/reconciliation", get(reconcile))
        .route("/reservations", post(create_reservation))
        .route("/reservations/:id", get(get_reservation))
        .route("/reservations/:id/confirm", post(confirm_reservation))
        .route("/reservations/:id/cancel", post(cancel_reservation))
        .route("/orders/:order_id/reservations", get(order_reservations))
        .route("/webhooks/:provider", post(receive_webhook))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn health_check() -> &'static str {
    "OK"
}

pub async fn register_product(
    State(state): State<AppState>,
    Json(request): Json<RegisterProductRequest>,
) -> Result<(StatusCode, Json<StockAdjustment>), AppError> {
    let adjustment = state.ledger.register(request.product_id, request.quantity).await?;
    Ok((StatusCode::CREATED, Json(adjustment)))
}

pub async fn get_stock(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
) -> Result<Json<ProductStock>, AppError> {
    Ok(Json(state.ledger.stock(product_id).await?))
}

pub async fn adjust_stock(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    Json(request): Json<AdjustStockRequest>,
) -> Result<Json<StockAdjustment>, AppError> {
    let adjustment = state
        .ledger
        .adjust(product_id, request.delta, MovementReason::ManualAdjust)
        .await?;
    Ok(Json(adjustment))
}

pub async fn list_movements(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
) -> Result<Json<Vec<StockMovement>>, AppError> {
    state.ledger.stock(product_id).await?;
    Ok(Json(state.ledger.movements(product_id).await?))
}

pub async fn reconcile(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
) -> Result<Json<ReconciliationReport>, AppError> {
    Ok(Json(state.ledger.reconcile(product_id).await?))
}

pub async fn create_reservation(
    State(state): State<AppState>,
    Json(request): Json<CreateReservationRequest>,
) -> Result<(StatusCode, Json<Reservation>), AppError> {
    let reservation = state
        .reservations
        .reserve(request.product_id, request.quantity, request.order_id)
        .await?;
    Ok((StatusCode::CREATED, Json(reservation)))
}

pub async fn get_reservation(
    State(state): State<AppState>,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<Reservation>, AppError> {
    Ok(Json(state.reservations.get(reservation_id).await?))
}

pub async fn confirm_reservation(
    State(state): State<AppState>,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<Reservation>, AppError> {
    Ok(Json(state.reservations.confirm(reservation_id).await?))
}

pub async fn cancel_reservation(
    State(state): State<AppState>,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<Reservation>, AppError> {
    Ok(Json(state.reservations.cancel(reservation_id).await?))
}

pub async fn order_reservations(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Vec<Reservation>>, AppError> {
    Ok(Json(state.reservations.for_order(order_id).await?))
}

pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, AppError> {
    let webhook = InboundWebhook::new(body.to_vec(), headers, state.clock.now()).with_query(query);

    match state.processor.process(&provider, &webhook).await? {
        ProcessOutcome::Applied(summary) => Ok(Json(WebhookResponse {
            status: "applied",
            result: Some(summary),
        })),
        ProcessOutcome::Replayed(summary) => Ok(Json(WebhookResponse {
            status: "replayed",
            result: Some(summary),
        })),
        ProcessOutcome::InProgress { event_key } => Err(AppError::InProgress(event_key)),
    }
}
