//! Runs the concurrency scenarios against the Postgres stores.
//!
//! These need a reachable database: `DATABASE_URL=postgres://... cargo test -- --ignored`.
//! Every test works on fresh product ids and event keys, so a shared database is fine.

mod common;

use std::sync::{Arc, Once};

use chrono::{Duration, Utc};
use diesel::{Connection, PgConnection};
use diesel_async::pooled_connection::{bb8::Pool, AsyncDieselConnectionManager};
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use futures::future::join_all;
use inventory_service::api::AppState;
use inventory_service::clock::{Clock, ManualClock};
use inventory_service::error::InventoryError;
use inventory_service::idempotency::{BeginOutcome, IdempotencyPolicy, IdempotencyStore, PgIdempotencyStore};
use inventory_service::store::postgres::DbPool;
use serde_json::json;
use shared::{IdempotencyStatus, MovementReason, ReservationState};
use uuid::Uuid;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");
static MIGRATED: Once = Once::new();

async fn pool() -> Option<DbPool> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL is not set; skipping");
        return None;
    };

    let migrate_url = url.clone();
    tokio::task::spawn_blocking(move || {
        MIGRATED.call_once(|| {
            let mut conn = PgConnection::establish(&migrate_url).unwrap();
            conn.run_pending_migrations(MIGRATIONS).unwrap();
        });
    })
    .await
    .unwrap();

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(url);
    Some(Pool::builder().build(manager).await.unwrap())
}

struct PgApp {
    state: AppState,
    clock: Arc<ManualClock>,
}

async fn pg_app(reservation_ttl: Duration) -> Option<PgApp> {
    let pool = pool().await?;
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mut config = common::config();
    config.reservation_ttl = reservation_ttl;

    let state = AppState::postgres(pool, &config, clock.clone());
    Some(PgApp { state, clock })
}

impl PgApp {
    async fn product(&self, quantity: i32) -> Uuid {
        let product_id = Uuid::new_v4();
        self.state.ledger.register(product_id, quantity).await.unwrap();
        product_id
    }

    async fn available(&self, product_id: Uuid) -> i32 {
        self.state.ledger.get_available(product_id).await.unwrap()
    }

    async fn releases(&self, product_id: Uuid, reservation_id: Uuid) -> usize {
        self.state
            .ledger
            .movements(product_id)
            .await
            .unwrap()
            .iter()
            .filter(|m| m.reservation_id == Some(reservation_id) && m.reason == MovementReason::Release)
            .count()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "needs Postgres at DATABASE_URL"]
async fn conditional_update_prevents_oversell() {
    let Some(app) = pg_app(Duration::hours(24)).await else {
        return;
    };
    let product_id = app.product(5).await;

    let attempts = (0..2).map(|_| {
        let reservations = app.state.reservations.clone();
        tokio::spawn(async move { reservations.reserve(product_id, 3, None).await })
    });
    let results: Vec<_> = join_all(attempts).await.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(InventoryError::InsufficientStock { available: 2, .. }))));
    assert_eq!(app.available(product_id).await, 2);
    assert!(app.state.ledger.reconcile(product_id).await.unwrap().consistent);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "needs Postgres at DATABASE_URL"]
async fn guarded_cancel_credits_exactly_once() {
    let Some(app) = pg_app(Duration::hours(24)).await else {
        return;
    };
    let product_id = app.product(5).await;
    let reservation = app.state.reservations.reserve(product_id, 2, None).await.unwrap();

    let attempts = (0..8).map(|_| {
        let reservations = app.state.reservations.clone();
        tokio::spawn(async move { reservations.cancel(reservation.id).await })
    });
    let results: Vec<_> = join_all(attempts).await.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(
            *err,
            InventoryError::AlreadyTerminal {
                id: reservation.id,
                state: ReservationState::Cancelled
            }
        );
    }
    assert_eq!(app.available(product_id).await, 5);
    assert_eq!(app.releases(product_id, reservation.id).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "needs Postgres at DATABASE_URL"]
async fn sweep_and_confirm_settle_an_expired_row_once() {
    // Short TTL so the sweep only reaches rows this test created.
    let Some(app) = pg_app(Duration::seconds(1)).await else {
        return;
    };

    for _ in 0..10 {
        let product_id = app.product(5).await;
        let reservation = app.state.reservations.reserve(product_id, 2, None).await.unwrap();
        app.clock.advance(Duration::seconds(5));
        let now = app.clock.now();

        let sweeping = {
            let reservations = app.state.reservations.clone();
            tokio::spawn(async move { reservations.sweep_expired(now).await })
        };
        let confirming = {
            let reservations = app.state.reservations.clone();
            tokio::spawn(async move { reservations.confirm(reservation.id).await })
        };

        sweeping.await.unwrap().unwrap();
        assert_eq!(confirming.await.unwrap().unwrap_err(), InventoryError::Expired(reservation.id));

        assert_eq!(app.available(product_id).await, 5);
        assert_eq!(app.releases(product_id, reservation.id).await, 1);
        assert_eq!(
            app.state.reservations.get(reservation.id).await.unwrap().state,
            ReservationState::Expired
        );
        assert!(app.state.ledger.reconcile(product_id).await.unwrap().consistent);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "needs Postgres at DATABASE_URL"]
async fn concurrent_begin_admits_one_owner() {
    let Some(pool) = pool().await else {
        return;
    };
    let store = Arc::new(PgIdempotencyStore::new(pool, IdempotencyPolicy::default()));
    let key = format!("stripe:evt_{}", Uuid::new_v4());
    let now = Utc::now();

    let attempts = (0..16).map(|_| {
        let store = store.clone();
        let key = key.clone();
        tokio::spawn(async move { store.begin(&key, now).await })
    });
    let outcomes: Vec<BeginOutcome> = join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert_eq!(outcomes.iter().filter(|o| **o == BeginOutcome::Fresh).count(), 1);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, BeginOutcome::Fresh | BeginOutcome::AlreadyProcessing)));

    store.complete(&key, json!({"ok": true}), now).await.unwrap();
    assert_eq!(
        store.begin(&key, now + Duration::seconds(10)).await.unwrap(),
        BeginOutcome::AlreadyCompleted(json!({"ok": true}))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "needs Postgres at DATABASE_URL"]
async fn abandoned_record_is_reclaimed_by_one_caller() {
    let Some(pool) = pool().await else {
        return;
    };
    let store = Arc::new(PgIdempotencyStore::new(pool, IdempotencyPolicy::default()));
    let key = format!("hotmart:{}", Uuid::new_v4());
    let start = Utc::now();

    assert_eq!(store.begin(&key, start).await.unwrap(), BeginOutcome::Fresh);

    let later = start + Duration::minutes(6);
    let attempts = (0..16).map(|_| {
        let store = store.clone();
        let key = key.clone();
        tokio::spawn(async move { store.begin(&key, later).await })
    });
    let outcomes: Vec<BeginOutcome> = join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert_eq!(outcomes.iter().filter(|o| **o == BeginOutcome::Fresh).count(), 1);

    store.fail(&key, "ledger unavailable", later).await.unwrap();
    let record = store.get(&key).await.unwrap().unwrap();
    assert_eq!(record.status, IdempotencyStatus::Failed);
    assert_eq!(record.failure_reason.as_deref(), Some("ledger unavailable"));
}
