use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info};

use crate::clock::Clock;
use crate::idempotency::IdempotencyStore;
use crate::reservations::ReservationManager;

/// What one sweep pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_reservations: usize,
    pub purged_idempotency_records: usize,
}

pub struct Sweeper {
    reservations: ReservationManager,
    idempotency: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        reservations: ReservationManager,
        idempotency: Arc<dyn IdempotencyStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            reservations,
            idempotency,
            clock,
            interval,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            if let Err(e) = self.sweep_once().await {
                error!("Error sweeping expired state: {:#}", e);
            }
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let expired_reservations = self.reservations.sweep_expired(now).await?;
        let purged_idempotency_records = self.idempotency.purge_expired(now).await?;

        if purged_idempotency_records > 0 {
            info!(count = purged_idempotency_records, "Purged expired idempotency records");
        }

        Ok(SweepReport {
            expired_reservations,
            purged_idempotency_records,
        })
    }
}
