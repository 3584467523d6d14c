use shared::Reservation;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::InventoryError;

/// Hooks for the notification collaborator. Called after the mutation has
/// committed; implementations must not block.
pub trait StockObserver: Send + Sync {
    fn on_low_stock(&self, product_id: Uuid, available: i32, threshold: i32);

    fn on_reservation_rejected(&self, product_id: Uuid, quantity: i32, order_id: Option<Uuid>, error: &InventoryError);

    fn on_reservation_settled(&self, reservation: &Reservation);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl StockObserver for TracingObserver {
    fn on_low_stock(&self, product_id: Uuid, available: i32, threshold: i32) {
        warn!(%product_id, available, threshold, "Product stock is running low");
    }

    fn on_reservation_rejected(&self, product_id: Uuid, quantity: i32, order_id: Option<Uuid>, error: &InventoryError) {
        info!(%product_id, quantity, ?order_id, %error, "Reservation rejected");
    }

    fn on_reservation_settled(&self, reservation: &Reservation) {
        info!(
            reservation_id = %reservation.id,
            order_id = ?reservation.order_id,
            state = %reservation.state,
            "Reservation settled"
        );
    }
}

/// Whether moving from `previous` to `current` crosses below `threshold`.
pub fn crossed_low_stock(previous: i32, current: i32, threshold: i32) -> bool {
    previous > threshold && current <= threshold
}
