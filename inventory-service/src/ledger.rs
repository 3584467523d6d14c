use serde::Serialize;
use shared::{MovementReason, ProductStock, StockMovement};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::InventoryError;
use crate::notify::{crossed_low_stock, StockObserver};
use crate::store::{InventoryStore, StockAdjustment, StockChange};

/// Result of replaying a product's movement log against its stock row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub product_id: Uuid,
    pub available_quantity: i32,
    pub replayed_quantity: i32,
    pub movement_count: usize,
    /// Movements whose `previous_quantity` does not continue the prior `new_quantity`,
    /// or whose `new_quantity != previous_quantity + delta`.
    pub broken_links: Vec<Uuid>,
    pub consistent: bool,
}

#[derive(Clone)]
pub struct StockLedger {
    store: Arc<dyn InventoryStore>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn StockObserver>,
    low_stock_threshold: i32,
}

impl StockLedger {
    pub fn new(
        store: Arc<dyn InventoryStore>,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn StockObserver>,
        low_stock_threshold: i32,
    ) -> Self {
        Self {
            store,
            clock,
            observer,
            low_stock_threshold,
        }
    }

    pub async fn register(&self, product_id: Uuid, initial_quantity: i32) -> Result<StockAdjustment, InventoryError> {
        if initial_quantity < 0 {
            return Err(InventoryError::InvalidQuantity(format!(
                "initial quantity must be non-negative, got {}",
                initial_quantity
            )));
        }

        let adjustment = self
            .store
            .register_product(product_id, initial_quantity, self.clock.now())
            .await?;
        info!(%product_id, quantity = initial_quantity, "Registered product stock");
        Ok(adjustment)
    }

    pub async fn adjust(
        &self,
        product_id: Uuid,
        delta: i32,
        reason: MovementReason,
    ) -> Result<StockAdjustment, InventoryError> {
        self.apply(StockChange::new(product_id, delta, reason)).await
    }

    /// Applies a change carrying reservation/order correlation.
    pub async fn apply(&self, change: StockChange) -> Result<StockAdjustment, InventoryError> {
        let product_id = change.product_id;
        let reason = change.reason;
        let adjustment = self.store.adjust(change, self.clock.now()).await?;

        debug!(
            %product_id,
            %reason,
            previous = adjustment.previous_quantity,
            new = adjustment.new_quantity,
            version = adjustment.version,
            "Adjusted stock"
        );
        self.observe(&adjustment);
        Ok(adjustment)
    }

    /// Advisory read; the value may be stale by the time the caller acts on it.
    pub async fn get_available(&self, product_id: Uuid) -> Result<i32, InventoryError> {
        Ok(self.stock(product_id).await?.available_quantity)
    }

    pub async fn stock(&self, product_id: Uuid) -> Result<ProductStock, InventoryError> {
        self.store
            .product(product_id)
            .await?
            .ok_or(InventoryError::ProductNotFound(product_id))
    }

    pub async fn movements(&self, product_id: Uuid) -> Result<Vec<StockMovement>, InventoryError> {
        self.store.movements(product_id).await
    }

    pub async fn reconcile(&self, product_id: Uuid) -> Result<ReconciliationReport, InventoryError> {
        let stock = self.stock(product_id).await?;
        let movements = self.store.movements(product_id).await?;

        let mut replayed = 0;
        let mut broken_links = Vec::new();
        for movement in &movements {
            let chained = movement.previous_quantity == replayed;
            let arithmetic = movement.previous_quantity.checked_add(movement.delta) == Some(movement.new_quantity);
            if !chained || !arithmetic {
                broken_links.push(movement.id);
            }
            replayed = movement.new_quantity;
        }

        let consistent = broken_links.is_empty() && replayed == stock.available_quantity;
        if !consistent {
            warn!(
                %product_id,
                available = stock.available_quantity,
                replayed,
                broken = broken_links.len(),
                "Stock ledger does not reconcile"
            );
        }

        Ok(ReconciliationReport {
            product_id,
            available_quantity: stock.available_quantity,
            replayed_quantity: replayed,
            movement_count: movements.len(),
            broken_links,
            consistent,
        })
    }

    /// Fires notifications for an adjustment that already committed.
    pub(crate) fn observe(&self, adjustment: &StockAdjustment) {
        if crossed_low_stock(adjustment.previous_quantity, adjustment.new_quantity, self.low_stock_threshold) {
            self.observer
                .on_low_stock(adjustment.product_id, adjustment.new_quantity, self.low_stock_threshold);
        }
    }
}
