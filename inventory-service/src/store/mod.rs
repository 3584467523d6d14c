//! Storage seam for the stock ledger and reservations.
//!
//! Stock rows and reservation rows live behind one trait because a
//! reservation state change and its ledger credit/debit must commit together.
//! Every method is a single atomic unit in the backing store: there is no
//! read-then-write split across calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{MovementReason, ProductStock, Reservation, ReservationState, StockMovement};
use uuid::Uuid;

use crate::error::InventoryError;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryInventoryStore;
pub use postgres::PgInventoryStore;

/// A requested change to one product's available quantity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockChange {
    pub product_id: Uuid,
    pub delta: i32,
    pub reason: MovementReason,
    pub reservation_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
}

impl StockChange {
    pub fn new(product_id: Uuid, delta: i32, reason: MovementReason) -> Self {
        Self {
            product_id,
            delta,
            reason,
            reservation_id: None,
            order_id: None,
        }
    }

    pub fn for_reservation(reservation: &Reservation, delta: i32, reason: MovementReason) -> Self {
        Self {
            product_id: reservation.product_id,
            delta,
            reason,
            reservation_id: Some(reservation.id),
            order_id: reservation.order_id,
        }
    }

    pub fn with_order(mut self, order_id: Option<Uuid>) -> Self {
        self.order_id = order_id;
        self
    }

    pub(crate) fn movement(&self, previous_quantity: i32, now: DateTime<Utc>) -> StockMovement {
        StockMovement {
            id: Uuid::new_v4(),
            product_id: self.product_id,
            previous_quantity,
            new_quantity: previous_quantity + self.delta,
            delta: self.delta,
            reason: self.reason,
            reservation_id: self.reservation_id,
            order_id: self.order_id,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockAdjustment {
    pub product_id: Uuid,
    pub previous_quantity: i32,
    pub new_quantity: i32,
    pub version: i64,
    pub movement_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `Reserved -> Confirmed`; a row already past expiry is expired in place instead.
    Confirm,
    /// `Reserved -> Cancelled`, crediting the held quantity.
    Cancel,
    /// `Reserved -> Expired` for rows past `expires_at`, crediting the held quantity.
    Expire,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionResult {
    pub reservation: Reservation,
    pub adjustment: StockAdjustment,
}

#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Creates the stock row at zero and credits `initial_quantity` as a manual adjustment.
    async fn register_product(
        &self,
        product_id: Uuid,
        initial_quantity: i32,
        now: DateTime<Utc>,
    ) -> Result<StockAdjustment, InventoryError>;

    async fn product(&self, product_id: Uuid) -> Result<Option<ProductStock>, InventoryError>;

    /// Applies `change.delta` iff the result stays non-negative, writing one movement row.
    async fn adjust(&self, change: StockChange, now: DateTime<Utc>) -> Result<StockAdjustment, InventoryError>;

    /// Movement log for a product, oldest first.
    async fn movements(&self, product_id: Uuid) -> Result<Vec<StockMovement>, InventoryError>;

    /// Debits the ledger and inserts the `Reserved` row together; neither happens on failure.
    async fn create_reservation(
        &self,
        reservation: Reservation,
    ) -> Result<(Reservation, StockAdjustment), InventoryError>;

    async fn reservation(&self, id: Uuid) -> Result<Option<Reservation>, InventoryError>;

    async fn reservations_for_order(&self, order_id: Uuid) -> Result<Vec<Reservation>, InventoryError>;

    /// Moves a `Reserved` row to a terminal state. Only the caller whose
    /// state-guarded update succeeds gets `Ok`; every other caller observes
    /// `AlreadyTerminal`/`Expired` and the ledger is left untouched.
    async fn transition(
        &self,
        id: Uuid,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, InventoryError>;

    /// Ids of `Reserved` rows whose `expires_at` is before `now`.
    async fn expired_reservations(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, InventoryError>;
}

/// Error for a transition attempted on a row that has already left `Reserved`.
/// A confirm that finds the row expired reports `Expired` so the caller knows
/// the stock went back to the pool.
pub(crate) fn terminal_error(reservation: &Reservation, transition: Transition) -> InventoryError {
    match (transition, reservation.state) {
        (Transition::Confirm, ReservationState::Expired) => InventoryError::Expired(reservation.id),
        (_, state) => InventoryError::AlreadyTerminal {
            id: reservation.id,
            state,
        },
    }
}

/// How a `Reserved` row leaves that state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Settlement {
    pub target: ReservationState,
    pub delta: i32,
    pub reason: MovementReason,
}

/// Decides the terminal state and ledger change for `transition`. Both
/// backends run this against the row they are about to guard-update.
pub(crate) fn plan_transition(
    reservation: &Reservation,
    transition: Transition,
    now: DateTime<Utc>,
) -> Result<Settlement, InventoryError> {
    if reservation.state.is_terminal() {
        return Err(terminal_error(reservation, transition));
    }

    let past_expiry = reservation.is_past_expiry(now);
    let target = match transition {
        Transition::Confirm if past_expiry => ReservationState::Expired,
        Transition::Confirm => ReservationState::Confirmed,
        Transition::Cancel => ReservationState::Cancelled,
        Transition::Expire if !past_expiry => return Err(InventoryError::NotYetExpired(reservation.id)),
        Transition::Expire => ReservationState::Expired,
    };

    Ok(if target.releases_stock() {
        Settlement {
            target,
            delta: reservation.quantity,
            reason: MovementReason::Release,
        }
    } else {
        Settlement {
            target,
            delta: 0,
            reason: MovementReason::Confirm,
        }
    })
}

pub(crate) fn insufficient(product_id: Uuid, delta: i32, available: i32) -> InventoryError {
    InventoryError::InsufficientStock {
        product_id,
        requested: delta.saturating_neg(),
        available,
    }
}
