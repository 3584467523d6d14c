use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::*;
use tracing::debug;
use uuid::Uuid;

use super::{
    insufficient, plan_transition, terminal_error, InventoryStore, StockAdjustment, StockChange, Transition,
    TransitionResult,
};
use crate::error::InventoryError;
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

pub struct PgInventoryStore {
    pool: DbPool,
}

impl PgInventoryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn pool_error(err: impl std::fmt::Display) -> InventoryError {
    InventoryError::Storage(format!("connection pool: {}", err))
}

/// Single-statement conditional debit/credit. The `available_quantity >= -delta`
/// guard is evaluated under the row lock taken by the UPDATE, so concurrent
/// callers on one product serialize here and the loser sees zero rows.
async fn apply_change(
    conn: &mut AsyncPgConnection,
    change: &StockChange,
    now: DateTime<Utc>,
) -> Result<StockAdjustment, InventoryError> {
    let floor = change
        .delta
        .checked_neg()
        .ok_or_else(|| InventoryError::InvalidQuantity(format!("delta {} out of range", change.delta)))?;

    let updated = diesel::update(
        product_stock::table
            .filter(product_stock::product_id.eq(change.product_id))
            .filter(product_stock::available_quantity.ge(floor)),
    )
    .set((
        product_stock::available_quantity.eq(product_stock::available_quantity + change.delta),
        product_stock::version.eq(product_stock::version + 1),
        product_stock::updated_at.eq(now),
    ))
    .returning((product_stock::available_quantity, product_stock::version))
    .get_result::<(i32, i64)>(conn)
    .await
    .optional()?;

    let Some((new_quantity, version)) = updated else {
        let available = product_stock::table
            .find(change.product_id)
            .select(product_stock::available_quantity)
            .first::<i32>(conn)
            .await
            .optional()?;

        return Err(match available {
            Some(available) => insufficient(change.product_id, change.delta, available),
            None => InventoryError::ProductNotFound(change.product_id),
        });
    };

    let previous_quantity = new_quantity - change.delta;
    let movement = change.movement(previous_quantity, now);
    diesel::insert_into(stock_movements::table)
        .values(NewStockMovement::from(&movement))
        .execute(conn)
        .await?;

    Ok(StockAdjustment {
        product_id: change.product_id,
        previous_quantity,
        new_quantity,
        version,
        movement_id: movement.id,
    })
}

async fn load_reservation(conn: &mut AsyncPgConnection, id: Uuid) -> Result<Option<Reservation>, InventoryError> {
    reservations::table
        .find(id)
        .first::<DbReservation>(conn)
        .await
        .optional()?
        .map(Reservation::try_from)
        .transpose()
}

#[async_trait]
impl InventoryStore for PgInventoryStore {
    async fn register_product(
        &self,
        product_id: Uuid,
        initial_quantity: i32,
        now: DateTime<Utc>,
    ) -> Result<StockAdjustment, InventoryError> {
        let mut pooled = self.pool.get().await.map_err(pool_error)?;
        let conn: &mut AsyncPgConnection = &mut pooled;

        conn.transaction::<_, InventoryError, _>(|conn| {
            Box::pin(async move {
                let row = DbProductStock {
                    product_id,
                    available_quantity: 0,
                    version: 0,
                    created_at: now,
                    updated_at: now,
                };

                let inserted = diesel::insert_into(product_stock::table)
                    .values(&row)
                    .on_conflict_do_nothing()
                    .execute(conn)
                    .await?;
                if inserted == 0 {
                    return Err(InventoryError::ProductAlreadyExists(product_id));
                }

                let change = StockChange::new(product_id, initial_quantity, MovementReason::ManualAdjust);
                apply_change(conn, &change, now).await
            })
        })
        .await
    }

    async fn product(&self, product_id: Uuid) -> Result<Option<ProductStock>, InventoryError> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        let row = product_stock::table
            .find(product_id)
            .first::<DbProductStock>(&mut conn)
            .await
            .optional()?;

        Ok(row.map(ProductStock::from))
    }

    async fn adjust(&self, change: StockChange, now: DateTime<Utc>) -> Result<StockAdjustment, InventoryError> {
        let mut pooled = self.pool.get().await.map_err(pool_error)?;
        let conn: &mut AsyncPgConnection = &mut pooled;

        conn.transaction::<_, InventoryError, _>(|conn| Box::pin(async move { apply_change(conn, &change, now).await }))
            .await
    }

    async fn movements(&self, product_id: Uuid) -> Result<Vec<StockMovement>, InventoryError> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        let rows = stock_movements::table
            .filter(stock_movements::product_id.eq(product_id))
            .order(stock_movements::seq.asc())
            .load::<DbStockMovement>(&mut conn)
            .await?;

        rows.into_iter().map(StockMovement::try_from).collect()
    }

    async fn create_reservation(
        &self,
        reservation: Reservation,
    ) -> Result<(Reservation, StockAdjustment), InventoryError> {
        let mut pooled = self.pool.get().await.map_err(pool_error)?;
        let conn: &mut AsyncPgConnection = &mut pooled;

        conn.transaction::<_, InventoryError, _>(|conn| {
            Box::pin(async move {
                let change = StockChange::for_reservation(&reservation, -reservation.quantity, MovementReason::Reserve);
                let adjustment = apply_change(conn, &change, reservation.created_at).await?;

                diesel::insert_into(reservations::table)
                    .values(DbReservation::from(&reservation))
                    .execute(conn)
                    .await?;

                Ok((reservation, adjustment))
            })
        })
        .await
    }

    async fn reservation(&self, id: Uuid) -> Result<Option<Reservation>, InventoryError> {
        let mut pooled = self.pool.get().await.map_err(pool_error)?;
        load_reservation(&mut pooled, id).await
    }

    async fn reservations_for_order(&self, order_id: Uuid) -> Result<Vec<Reservation>, InventoryError> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        let rows = reservations::table
            .filter(reservations::order_id.eq(order_id))
            .order(reservations::created_at.asc())
            .load::<DbReservation>(&mut conn)
            .await?;

        rows.into_iter().map(Reservation::try_from).collect()
    }

    async fn transition(
        &self,
        id: Uuid,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, InventoryError> {
        let mut pooled = self.pool.get().await.map_err(pool_error)?;
        let conn: &mut AsyncPgConnection = &mut pooled;

        conn.transaction::<_, InventoryError, _>(|conn| {
            Box::pin(async move {
                let reservation = load_reservation(conn, id)
                    .await?
                    .ok_or(InventoryError::ReservationNotFound(id))?;
                let settlement = plan_transition(&reservation, transition, now)?;

                let updated = diesel::update(
                    reservations::table
                        .filter(reservations::id.eq(id))
                        .filter(reservations::state.eq(ReservationState::Reserved.as_str())),
                )
                .set((
                    reservations::state.eq(settlement.target.as_str()),
                    reservations::updated_at.eq(now),
                ))
                .get_result::<DbReservation>(conn)
                .await
                .optional()?;

                let Some(updated) = updated else {
                    // Another transaction settled the row between our read and the guarded update.
                    let current = load_reservation(conn, id)
                        .await?
                        .ok_or(InventoryError::ReservationNotFound(id))?;
                    debug!(reservation_id = %id, state = %current.state, "Lost reservation transition race");
                    return Err(terminal_error(&current, transition));
                };

                let change = StockChange::for_reservation(&reservation, settlement.delta, settlement.reason);
                let adjustment = apply_change(conn, &change, now).await?;

                Ok(TransitionResult {
                    reservation: Reservation::try_from(updated)?,
                    adjustment,
                })
            })
        })
        .await
    }

    async fn expired_reservations(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, InventoryError> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        let ids = reservations::table
            .filter(reservations::state.eq(ReservationState::Reserved.as_str()))
            .filter(reservations::expires_at.lt(now))
            .order(reservations::expires_at.asc())
            .limit(limit)
            .select(reservations::id)
            .load::<Uuid>(&mut conn)
            .await?;

        Ok(ids)
    }
}
