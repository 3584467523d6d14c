use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared::*;
use uuid::Uuid;

use crate::error::{IdempotencyError, InventoryError};

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::product_stock)]
pub struct DbProductStock {
    pub product_id: Uuid,
    pub available_quantity: i32,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::reservations)]
pub struct DbReservation {
    pub id: Uuid,
    pub product_id: Uuid,
    pub order_id: Option<Uuid>,
    pub quantity: i32,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::stock_movements)]
pub struct DbStockMovement {
    pub id: Uuid,
    pub product_id: Uuid,
    pub previous_quantity: i32,
    pub new_quantity: i32,
    pub delta: i32,
    pub reason: String,
    pub reservation_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub seq: i64,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::stock_movements)]
pub struct NewStockMovement {
    pub id: Uuid,
    pub product_id: Uuid,
    pub previous_quantity: i32,
    pub new_quantity: i32,
    pub delta: i32,
    pub reason: String,
    pub reservation_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::idempotency_records)]
pub struct DbIdempotencyRecord {
    pub event_key: String,
    pub status: String,
    pub result_summary: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<DbProductStock> for ProductStock {
    fn from(row: DbProductStock) -> Self {
        Self {
            product_id: row.product_id,
            available_quantity: row.available_quantity,
            version: row.version,
            updated_at: row.updated_at,
        }
    }
}

impl TryFrom<DbReservation> for Reservation {
    type Error = InventoryError;

    fn try_from(row: DbReservation) -> Result<Self, Self::Error> {
        let state = ReservationState::parse(&row.state).ok_or_else(|| {
            InventoryError::Storage(format!("unknown reservation state '{}' on {}", row.state, row.id))
        })?;

        Ok(Self {
            id: row.id,
            product_id: row.product_id,
            order_id: row.order_id,
            quantity: row.quantity,
            state,
            created_at: row.created_at,
            expires_at: row.expires_at,
            updated_at: row.updated_at,
        })
    }
}

impl From<&Reservation> for DbReservation {
    fn from(reservation: &Reservation) -> Self {
        Self {
            id: reservation.id,
            product_id: reservation.product_id,
            order_id: reservation.order_id,
            quantity: reservation.quantity,
            state: reservation.state.as_str().to_string(),
            created_at: reservation.created_at,
            expires_at: reservation.expires_at,
            updated_at: reservation.updated_at,
        }
    }
}

impl TryFrom<DbStockMovement> for StockMovement {
    type Error = InventoryError;

    fn try_from(row: DbStockMovement) -> Result<Self, Self::Error> {
        let reason = MovementReason::parse(&row.reason).ok_or_else(|| {
            InventoryError::Storage(format!("unknown movement reason '{}' on {}", row.reason, row.id))
        })?;

        Ok(Self {
            id: row.id,
            product_id: row.product_id,
            previous_quantity: row.previous_quantity,
            new_quantity: row.new_quantity,
            delta: row.delta,
            reason,
            reservation_id: row.reservation_id,
            order_id: row.order_id,
            created_at: row.created_at,
        })
    }
}

impl From<&StockMovement> for NewStockMovement {
    fn from(movement: &StockMovement) -> Self {
        Self {
            id: movement.id,
            product_id: movement.product_id,
            previous_quantity: movement.previous_quantity,
            new_quantity: movement.new_quantity,
            delta: movement.delta,
            reason: movement.reason.as_str().to_string(),
            reservation_id: movement.reservation_id,
            order_id: movement.order_id,
            created_at: movement.created_at,
        }
    }
}

impl TryFrom<DbIdempotencyRecord> for IdempotencyRecord {
    type Error = IdempotencyError;

    fn try_from(row: DbIdempotencyRecord) -> Result<Self, Self::Error> {
        let status = IdempotencyStatus::parse(&row.status).ok_or_else(|| {
            IdempotencyError::Storage(format!("unknown idempotency status '{}' on {}", row.status, row.event_key))
        })?;

        Ok(Self {
            event_key: row.event_key,
            status,
            result_summary: row.result_summary,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
        })
    }
}
