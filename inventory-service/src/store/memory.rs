use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{MovementReason, ProductStock, Reservation, ReservationState, StockMovement};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{insufficient, plan_transition, InventoryStore, StockAdjustment, StockChange, Transition, TransitionResult};
use crate::error::InventoryError;

#[derive(Default)]
struct InventoryState {
    products: HashMap<Uuid, ProductStock>,
    reservations: HashMap<Uuid, Reservation>,
    movements: Vec<StockMovement>,
}

impl InventoryState {
    fn apply(&mut self, change: &StockChange, now: DateTime<Utc>) -> Result<StockAdjustment, InventoryError> {
        let stock = self
            .products
            .get_mut(&change.product_id)
            .ok_or(InventoryError::ProductNotFound(change.product_id))?;

        let previous = stock.available_quantity;
        let new_quantity = previous
            .checked_add(change.delta)
            .ok_or_else(|| InventoryError::InvalidQuantity(format!("delta {} overflows stock", change.delta)))?;
        if new_quantity < 0 {
            return Err(insufficient(change.product_id, change.delta, previous));
        }

        stock.available_quantity = new_quantity;
        stock.version += 1;
        stock.updated_at = now;
        let version = stock.version;

        let movement = change.movement(previous, now);
        let movement_id = movement.id;
        self.movements.push(movement);

        Ok(StockAdjustment {
            product_id: change.product_id,
            previous_quantity: previous,
            new_quantity,
            version,
            movement_id,
        })
    }

    /// Moves a reserved row to `target`, applying `delta` in the same step.
    fn settle(
        &mut self,
        id: Uuid,
        target: ReservationState,
        delta: i32,
        reason: MovementReason,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, InventoryError> {
        let reservation = self
            .reservations
            .get(&id)
            .cloned()
            .ok_or(InventoryError::ReservationNotFound(id))?;

        let adjustment = self.apply(&StockChange::for_reservation(&reservation, delta, reason), now)?;

        let row = self
            .reservations
            .get_mut(&id)
            .ok_or(InventoryError::ReservationNotFound(id))?;
        row.state = target;
        row.updated_at = now;

        Ok(TransitionResult {
            reservation: row.clone(),
            adjustment,
        })
    }
}

/// Inventory store held in process memory. Every operation runs inside one
/// critical section, which serializes concurrent callers per product and
/// per reservation.
#[derive(Default)]
pub struct InMemoryInventoryStore {
    state: Mutex<InventoryState>,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn register_product(
        &self,
        product_id: Uuid,
        initial_quantity: i32,
        now: DateTime<Utc>,
    ) -> Result<StockAdjustment, InventoryError> {
        let mut state = self.state.lock().await;
        if state.products.contains_key(&product_id) {
            return Err(InventoryError::ProductAlreadyExists(product_id));
        }

        state.products.insert(
            product_id,
            ProductStock {
                product_id,
                available_quantity: 0,
                version: 0,
                updated_at: now,
            },
        );

        match state.apply(&StockChange::new(product_id, initial_quantity, MovementReason::ManualAdjust), now) {
            Ok(adjustment) => Ok(adjustment),
            Err(err) => {
                state.products.remove(&product_id);
                Err(err)
            }
        }
    }

    async fn product(&self, product_id: Uuid) -> Result<Option<ProductStock>, InventoryError> {
        Ok(self.state.lock().await.products.get(&product_id).cloned())
    }

    async fn adjust(&self, change: StockChange, now: DateTime<Utc>) -> Result<StockAdjustment, InventoryError> {
        self.state.lock().await.apply(&change, now)
    }

    async fn movements(&self, product_id: Uuid) -> Result<Vec<StockMovement>, InventoryError> {
        let state = self.state.lock().await;
        Ok(state
            .movements
            .iter()
            .filter(|m| m.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn create_reservation(
        &self,
        reservation: Reservation,
    ) -> Result<(Reservation, StockAdjustment), InventoryError> {
        let mut state = self.state.lock().await;
        let change = StockChange::for_reservation(&reservation, -reservation.quantity, MovementReason::Reserve);
        let adjustment = state.apply(&change, reservation.created_at)?;
        state.reservations.insert(reservation.id, reservation.clone());
        Ok((reservation, adjustment))
    }

    async fn reservation(&self, id: Uuid) -> Result<Option<Reservation>, InventoryError> {
        Ok(self.state.lock().await.reservations.get(&id).cloned())
    }

    async fn reservations_for_order(&self, order_id: Uuid) -> Result<Vec<Reservation>, InventoryError> {
        let state = self.state.lock().await;
        let mut found: Vec<Reservation> = state
            .reservations
            .values()
            .filter(|r| r.order_id == Some(order_id))
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }

    async fn transition(
        &self,
        id: Uuid,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, InventoryError> {
        let mut state = self.state.lock().await;
        let reservation = state
            .reservations
            .get(&id)
            .cloned()
            .ok_or(InventoryError::ReservationNotFound(id))?;

        let settlement = plan_transition(&reservation, transition, now)?;
        state.settle(id, settlement.target, settlement.delta, settlement.reason, now)
    }

    async fn expired_reservations(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, InventoryError> {
        let state = self.state.lock().await;
        let mut expired: Vec<&Reservation> = state
            .reservations
            .values()
            .filter(|r| r.state == ReservationState::Reserved && r.is_past_expiry(now))
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        Ok(expired
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|r| r.id)
            .collect())
    }
}
