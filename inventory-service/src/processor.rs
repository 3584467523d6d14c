use serde_json::Value;
use shared::{
    Effect, EventSummary, MovementReason, Reservation, ReservationEffect, ReservationOutcome, ReservationState,
    WebhookAction,
};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::{IdempotencyError, InventoryError, ProcessError};
use crate::idempotency::{BeginOutcome, IdempotencyStore};
use crate::reservations::ReservationManager;
use crate::store::StockChange;
use crate::webhooks::{InboundWebhook, NormalizedEvent, WebhookNormalizer};

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// First delivery; the mutation ran and its summary was recorded.
    Applied(EventSummary),
    /// Redelivery of a completed event; nothing ran.
    Replayed(EventSummary),
    /// Another delivery of the same event holds the key; retry later.
    InProgress { event_key: String },
}

#[derive(Clone)]
pub struct EventProcessor {
    normalizer: Arc<WebhookNormalizer>,
    idempotency: Arc<dyn IdempotencyStore>,
    reservations: ReservationManager,
    clock: Arc<dyn Clock>,
}

impl EventProcessor {
    pub fn new(
        normalizer: Arc<WebhookNormalizer>,
        idempotency: Arc<dyn IdempotencyStore>,
        reservations: ReservationManager,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            normalizer,
            idempotency,
            reservations,
            clock,
        }
    }

    pub fn normalizer(&self) -> &WebhookNormalizer {
        &self.normalizer
    }

    pub async fn process(&self, provider: &str, webhook: &InboundWebhook) -> Result<ProcessOutcome, ProcessError> {
        let event = self.normalizer.normalize(provider, webhook)?;
        let event_key = event.event_key.clone();

        match self.idempotency.begin(&event_key, self.clock.now()).await? {
            BeginOutcome::AlreadyCompleted(stored) => {
                info!(%event_key, "Replaying completed webhook");
                let summary = serde_json::from_value(stored).map_err(IdempotencyError::from)?;
                return Ok(ProcessOutcome::Replayed(summary));
            }
            BeginOutcome::AlreadyProcessing => {
                info!(%event_key, "Webhook already in flight");
                return Ok(ProcessOutcome::InProgress { event_key });
            }
            BeginOutcome::Fresh => {}
        }

        let effect = match self.apply(&event).await {
            Ok(effect) => effect,
            Err(source) => {
                warn!(%event_key, error = %source, "Webhook mutation failed; releasing key for retry");
                if let Err(e) = self.idempotency.fail(&event_key, &source.to_string(), self.clock.now()).await {
                    error!(%event_key, error = %e, "Failed to mark webhook as failed");
                }
                return Err(ProcessError::MutationFailed { event_key, source });
            }
        };

        let summary = EventSummary {
            event_key: event_key.clone(),
            provider: event.provider.clone(),
            action: event.action,
            effect,
            processed_at: self.clock.now(),
        };

        if let Err(e) = self.record(&summary).await {
            // The mutation already committed. The key stays Processing until its
            // staleness window passes; a redelivery before then is told to retry.
            error!(%event_key, error = %e, "Failed to record completed webhook");
        }

        info!(%event_key, action = ?summary.action, effect = ?summary.effect, "Applied webhook");
        Ok(ProcessOutcome::Applied(summary))
    }

    async fn record(&self, summary: &EventSummary) -> Result<(), IdempotencyError> {
        let stored: Value = serde_json::to_value(summary)?;
        self.idempotency
            .complete(&summary.event_key, stored, self.clock.now())
            .await
    }

    async fn apply(&self, event: &NormalizedEvent) -> Result<Effect, InventoryError> {
        match event.action {
            WebhookAction::Unknown => Ok(Effect::Ignored),
            WebhookAction::PurchaseApproved => {
                let targets = self.targets(event).await?;
                if targets.is_empty() {
                    return Ok(Effect::NothingToApply);
                }

                let mut effects = Vec::with_capacity(targets.len());
                for reservation in targets {
                    effects.push(settle(&reservation, self.reservations.confirm(reservation.id).await)?);
                }
                Ok(Effect::Reservations { reservations: effects })
            }
            WebhookAction::PurchaseRefunded | WebhookAction::SubscriptionCancelled => {
                let targets = self.targets(event).await?;
                if targets.is_empty() {
                    return self.compensate(event).await;
                }

                let mut effects = Vec::with_capacity(targets.len());
                for reservation in targets {
                    effects.push(settle(&reservation, self.reservations.cancel(reservation.id).await)?);
                }
                Ok(Effect::Reservations { reservations: effects })
            }
        }
    }

    /// Reservations an event refers to: the explicit reservation id if given,
    /// else every reservation of the referenced order.
    async fn targets(&self, event: &NormalizedEvent) -> Result<Vec<Reservation>, InventoryError> {
        if let Some(reservation_id) = event.reference.reservation_id {
            return match self.reservations.get(reservation_id).await {
                Ok(reservation) => Ok(vec![reservation]),
                Err(InventoryError::ReservationNotFound(_)) => {
                    warn!(event_key = %event.event_key, %reservation_id, "Webhook references unknown reservation");
                    Ok(Vec::new())
                }
                Err(e) => Err(e),
            };
        }

        match event.reference.order_id {
            Some(order_id) => self.reservations.for_order(order_id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Credits stock back for a refund that has no reservation to cancel.
    async fn compensate(&self, event: &NormalizedEvent) -> Result<Effect, InventoryError> {
        let (Some(product_id), Some(quantity)) = (event.reference.product_id, event.reference.quantity) else {
            return Ok(Effect::NothingToApply);
        };

        let change =
            StockChange::new(product_id, quantity, MovementReason::Release).with_order(event.reference.order_id);
        let adjustment = self.reservations.ledger().apply(change).await?;
        Ok(Effect::Credited {
            product_id,
            quantity,
            new_quantity: adjustment.new_quantity,
        })
    }
}

/// Folds a confirm/cancel result into the reported effect. Lost races are
/// outcomes, not failures; anything else aborts the event.
fn settle(
    reservation: &Reservation,
    result: Result<Reservation, InventoryError>,
) -> Result<ReservationEffect, InventoryError> {
    let (outcome, state) = match result {
        Ok(settled) => {
            let outcome = match settled.state {
                ReservationState::Confirmed => ReservationOutcome::Confirmed,
                ReservationState::Expired => ReservationOutcome::Expired,
                _ => ReservationOutcome::Cancelled,
            };
            (outcome, settled.state)
        }
        Err(InventoryError::Expired(_)) => (ReservationOutcome::Expired, ReservationState::Expired),
        Err(InventoryError::AlreadyTerminal { state, .. }) => (ReservationOutcome::AlreadyTerminal, state),
        Err(e) => return Err(e),
    };

    Ok(ReservationEffect {
        reservation_id: reservation.id,
        outcome,
        state,
    })
}
