use chrono::{DateTime, Duration, Utc};
use shared::{Reservation, ReservationState};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::InventoryError;
use crate::ledger::StockLedger;
use crate::notify::StockObserver;
use crate::store::{InventoryStore, Transition, TransitionResult};

#[derive(Clone)]
pub struct ReservationManager {
    store: Arc<dyn InventoryStore>,
    ledger: StockLedger,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn StockObserver>,
    ttl: Duration,
    sweep_batch: i64,
}

impl ReservationManager {
    pub fn new(
        store: Arc<dyn InventoryStore>,
        ledger: StockLedger,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn StockObserver>,
        ttl: Duration,
        sweep_batch: i64,
    ) -> Self {
        Self {
            store,
            ledger,
            clock,
            observer,
            ttl,
            sweep_batch: sweep_batch.max(1),
        }
    }

    pub fn ledger(&self) -> &StockLedger {
        &self.ledger
    }

    pub async fn reserve(
        &self,
        product_id: Uuid,
        quantity: i32,
        order_id: Option<Uuid>,
    ) -> Result<Reservation, InventoryError> {
        if quantity <= 0 {
            return Err(InventoryError::InvalidQuantity(format!(
                "reservation quantity must be positive, got {}",
                quantity
            )));
        }

        let now = self.clock.now();
        let reservation = Reservation {
            id: Uuid::new_v4(),
            product_id,
            order_id,
            quantity,
            state: ReservationState::Reserved,
            created_at: now,
            expires_at: now + self.ttl,
            updated_at: now,
        };

        match self.store.create_reservation(reservation).await {
            Ok((reservation, adjustment)) => {
                info!(
                    reservation_id = %reservation.id,
                    %product_id,
                    quantity,
                    ?order_id,
                    remaining = adjustment.new_quantity,
                    "Reserved stock"
                );
                self.ledger.observe(&adjustment);
                Ok(reservation)
            }
            Err(err) => {
                self.observer.on_reservation_rejected(product_id, quantity, order_id, &err);
                Err(err)
            }
        }
    }

    /// `Reserved -> Confirmed`. A reservation past its expiry is expired in
    /// place, its stock returned, and `Expired` reported.
    pub async fn confirm(&self, reservation_id: Uuid) -> Result<Reservation, InventoryError> {
        let result = self
            .store
            .transition(reservation_id, Transition::Confirm, self.clock.now())
            .await?;
        self.settled(&result);

        if result.reservation.state == ReservationState::Expired {
            return Err(InventoryError::Expired(reservation_id));
        }
        Ok(result.reservation)
    }

    pub async fn cancel(&self, reservation_id: Uuid) -> Result<Reservation, InventoryError> {
        let result = self
            .store
            .transition(reservation_id, Transition::Cancel, self.clock.now())
            .await?;
        self.settled(&result);
        Ok(result.reservation)
    }

    /// Expires every `Reserved` row past `expires_at` as of `now`, returning how
    /// many this call expired. Rows settled concurrently by another caller are
    /// skipped.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, InventoryError> {
        let mut expired = 0;

        loop {
            let batch = self.store.expired_reservations(now, self.sweep_batch).await?;
            let batch_len = batch.len();
            let mut progressed = false;

            for id in batch {
                match self.store.transition(id, Transition::Expire, now).await {
                    Ok(result) => {
                        self.settled(&result);
                        expired += 1;
                        progressed = true;
                    }
                    Err(err) if err.is_benign_race() => {
                        debug!(reservation_id = %id, %err, "Skipped reservation settled elsewhere");
                    }
                    Err(err) => {
                        warn!(reservation_id = %id, %err, "Failed to expire reservation");
                        return Err(err);
                    }
                }
            }

            // A short batch means the backlog is drained. A full batch of lost
            // races would be re-selected forever, so stop there too.
            if (batch_len as i64) < self.sweep_batch || !progressed {
                break;
            }
        }

        if expired > 0 {
            info!(count = expired, "Expired stale reservations");
        }
        Ok(expired)
    }

    pub async fn get(&self, reservation_id: Uuid) -> Result<Reservation, InventoryError> {
        self.store
            .reservation(reservation_id)
            .await?
            .ok_or(InventoryError::ReservationNotFound(reservation_id))
    }

    pub async fn for_order(&self, order_id: Uuid) -> Result<Vec<Reservation>, InventoryError> {
        self.store.reservations_for_order(order_id).await
    }

    fn settled(&self, result: &TransitionResult) {
        info!(
            reservation_id = %result.reservation.id,
            product_id = %result.reservation.product_id,
            state = %result.reservation.state,
            available = result.adjustment.new_quantity,
            "Reservation transitioned"
        );
        self.ledger.observe(&result.adjustment);
        self.observer.on_reservation_settled(&result.reservation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::testing::{Notice, RecordingObserver};
    use crate::store::InMemoryInventoryStore;
    use shared::MovementReason;

    struct Fixture {
        manager: ReservationManager,
        clock: Arc<ManualClock>,
        observer: Arc<RecordingObserver>,
    }

    fn fixture(batch: i64) -> Fixture {
        let store: Arc<dyn InventoryStore> = Arc::new(InMemoryInventoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let observer = Arc::new(RecordingObserver::default());
        let ledger = StockLedger::new(store.clone(), clock.clone(), observer.clone(), 0);
        let manager =
            ReservationManager::new(store, ledger, clock.clone(), observer.clone(), Duration::hours(24), batch);
        Fixture {
            manager,
            clock,
            observer,
        }
    }

    async fn stocked(fixture: &Fixture, quantity: i32) -> Uuid {
        let product_id = Uuid::new_v4();
        fixture.manager.ledger().register(product_id, quantity).await.unwrap();
        product_id
    }

    #[tokio::test]
    async fn reserve_debits_and_sets_expiry() {
        let f = fixture(10);
        let product_id = stocked(&f, 5).await;
        let order_id = Uuid::new_v4();

        let reservation = f.manager.reserve(product_id, 2, Some(order_id)).await.unwrap();
        assert_eq!(reservation.state, ReservationState::Reserved);
        assert_eq!(reservation.expires_at, f.clock.now() + Duration::hours(24));
        assert_eq!(f.manager.ledger().get_available(product_id).await.unwrap(), 3);

        let movements = f.manager.ledger().movements(product_id).await.unwrap();
        let last = movements.last().unwrap();
        assert_eq!(last.reason, MovementReason::Reserve);
        assert_eq!(last.reservation_id, Some(reservation.id));
        assert_eq!(last.order_id, Some(order_id));
    }

    #[tokio::test]
    async fn rejected_reservation_creates_nothing_and_notifies() {
        let f = fixture(10);
        let product_id = stocked(&f, 1).await;
        let order_id = Uuid::new_v4();

        let err = f.manager.reserve(product_id, 2, Some(order_id)).await.unwrap_err();
        assert!(matches!(err, InventoryError::InsufficientStock { .. }));
        assert!(f.manager.for_order(order_id).await.unwrap().is_empty());
        assert_eq!(
            f.observer.take(),
            vec![Notice::Rejected {
                product_id,
                quantity: 2
            }]
        );
    }

    #[tokio::test]
    async fn non_positive_quantity_is_invalid() {
        let f = fixture(10);
        let product_id = stocked(&f, 1).await;

        assert!(matches!(
            f.manager.reserve(product_id, 0, None).await.unwrap_err(),
            InventoryError::InvalidQuantity(_)
        ));
    }

    #[tokio::test]
    async fn confirm_keeps_stock_decremented() {
        let f = fixture(10);
        let product_id = stocked(&f, 5).await;
        let reservation = f.manager.reserve(product_id, 2, None).await.unwrap();

        let confirmed = f.manager.confirm(reservation.id).await.unwrap();
        assert_eq!(confirmed.state, ReservationState::Confirmed);
        assert_eq!(f.manager.ledger().get_available(product_id).await.unwrap(), 3);

        let movements = f.manager.ledger().movements(product_id).await.unwrap();
        let last = movements.last().unwrap();
        assert_eq!(last.reason, MovementReason::Confirm);
        assert_eq!(last.delta, 0);
    }

    #[tokio::test]
    async fn cancel_after_confirm_is_already_terminal() {
        let f = fixture(10);
        let product_id = stocked(&f, 5).await;
        let reservation = f.manager.reserve(product_id, 2, None).await.unwrap();
        f.manager.confirm(reservation.id).await.unwrap();

        assert_eq!(
            f.manager.cancel(reservation.id).await.unwrap_err(),
            InventoryError::AlreadyTerminal {
                id: reservation.id,
                state: ReservationState::Confirmed
            }
        );
        assert_eq!(f.manager.ledger().get_available(product_id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn confirm_past_expiry_releases_and_reports_expired() {
        let f = fixture(10);
        let product_id = stocked(&f, 5).await;
        let reservation = f.manager.reserve(product_id, 2, None).await.unwrap();

        f.clock.advance(Duration::hours(25));
        assert_eq!(
            f.manager.confirm(reservation.id).await.unwrap_err(),
            InventoryError::Expired(reservation.id)
        );
        assert_eq!(f.manager.get(reservation.id).await.unwrap().state, ReservationState::Expired);
        assert_eq!(f.manager.ledger().get_available(product_id).await.unwrap(), 5);

        // Still reported as expired on the next attempt, without a second credit.
        assert_eq!(
            f.manager.confirm(reservation.id).await.unwrap_err(),
            InventoryError::Expired(reservation.id)
        );
        assert_eq!(f.manager.ledger().get_available(product_id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn unknown_reservation_is_not_found() {
        let f = fixture(10);
        let id = Uuid::new_v4();

        assert_eq!(f.manager.confirm(id).await.unwrap_err(), InventoryError::ReservationNotFound(id));
        assert_eq!(f.manager.cancel(id).await.unwrap_err(), InventoryError::ReservationNotFound(id));
        assert_eq!(f.manager.get(id).await.unwrap_err(), InventoryError::ReservationNotFound(id));
    }

    #[tokio::test]
    async fn sweep_drains_in_batches() {
        let f = fixture(2);
        let product_id = stocked(&f, 10).await;
        for _ in 0..5 {
            f.manager.reserve(product_id, 1, None).await.unwrap();
        }
        let keep = {
            f.clock.advance(Duration::hours(1));
            f.manager.reserve(product_id, 1, None).await.unwrap()
        };
        assert_eq!(f.manager.ledger().get_available(product_id).await.unwrap(), 4);

        let now = f.clock.now() + Duration::hours(24) - Duration::minutes(30);
        assert_eq!(f.manager.sweep_expired(now).await.unwrap(), 5);
        assert_eq!(f.manager.ledger().get_available(product_id).await.unwrap(), 9);
        assert_eq!(f.manager.get(keep.id).await.unwrap().state, ReservationState::Reserved);

        assert_eq!(f.manager.sweep_expired(now).await.unwrap(), 0);
        assert!(f.manager.ledger().reconcile(product_id).await.unwrap().consistent);
    }
}
