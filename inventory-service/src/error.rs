use shared::ReservationState;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InventoryError {
    #[error("Insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: Uuid,
        requested: i32,
        available: i32,
    },

    #[error("Product not found: {0}")]
    ProductNotFound(Uuid),

    #[error("Product already registered: {0}")]
    ProductAlreadyExists(Uuid),

    #[error("Reservation not found: {0}")]
    ReservationNotFound(Uuid),

    #[error("Reservation {id} is already {state}")]
    AlreadyTerminal { id: Uuid, state: ReservationState },

    #[error("Reservation {0} has expired")]
    Expired(Uuid),

    #[error("Reservation {0} has not reached its expiry")]
    NotYetExpired(Uuid),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl InventoryError {
    /// Outcomes where another caller already settled the row; nothing was mutated.
    pub fn is_benign_race(&self) -> bool {
        matches!(
            self,
            Self::AlreadyTerminal { .. } | Self::Expired(_) | Self::NotYetExpired(_) | Self::ReservationNotFound(_)
        )
    }
}

impl From<diesel::result::Error> for InventoryError {
    fn from(err: diesel::result::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdempotencyError {
    #[error("Idempotency record {0} is not in processing state")]
    NotProcessing(String),

    #[error("Idempotency serialization error: {0}")]
    Serialization(String),

    #[error("Idempotency storage error: {0}")]
    Storage(String),
}

impl From<diesel::result::Error> for IdempotencyError {
    fn from(err: diesel::result::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for IdempotencyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WebhookError {
    #[error("Unknown webhook provider: {0}")]
    UnknownProvider(String),

    #[error("Webhook signature verification failed for {0}")]
    SignatureInvalid(String),

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error("Mutation failed for {event_key}: {source}")]
    MutationFailed {
        event_key: String,
        #[source]
        source: InventoryError,
    },

    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
}

impl ProcessError {
    /// Whether the webhook sender should redeliver.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Webhook(_))
    }
}
