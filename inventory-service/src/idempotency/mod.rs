//! At-most-once gate for webhook events, keyed by `provider:native_id`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use shared::{IdempotencyRecord, IdempotencyStatus};

use crate::error::IdempotencyError;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryIdempotencyStore;
pub use postgres::PgIdempotencyStore;

#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// The caller now owns the key and must finish with `complete` or `fail`.
    Fresh,
    AlreadyProcessing,
    AlreadyCompleted(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotencyPolicy {
    /// How long a completed record short-circuits redeliveries.
    pub completed_ttl: Duration,
    /// How long an in-flight record blocks others before it is considered abandoned.
    pub processing_stale_after: Duration,
}

impl Default for IdempotencyPolicy {
    fn default() -> Self {
        Self {
            completed_ttl: Duration::days(7),
            processing_stale_after: Duration::minutes(5),
        }
    }
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Claims `event_key` unless a live record already holds it. Expired,
    /// abandoned and failed records are reclaimed in the same atomic step.
    async fn begin(&self, event_key: &str, now: DateTime<Utc>) -> Result<BeginOutcome, IdempotencyError>;

    async fn complete(&self, event_key: &str, result: Value, now: DateTime<Utc>) -> Result<(), IdempotencyError>;

    async fn fail(&self, event_key: &str, reason: &str, now: DateTime<Utc>) -> Result<(), IdempotencyError>;

    async fn get(&self, event_key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError>;

    /// Deletes records whose `expires_at` has passed. Returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, IdempotencyError>;
}

/// What `begin` should do with an existing record.
pub(crate) fn classify(record: &IdempotencyRecord, now: DateTime<Utc>) -> BeginOutcome {
    if record.expires_at <= now {
        return BeginOutcome::Fresh;
    }

    match record.status {
        IdempotencyStatus::Failed => BeginOutcome::Fresh,
        IdempotencyStatus::Processing => BeginOutcome::AlreadyProcessing,
        IdempotencyStatus::Completed => {
            BeginOutcome::AlreadyCompleted(record.result_summary.clone().unwrap_or(Value::Null))
        }
    }
}

pub(crate) fn processing_record(event_key: &str, policy: &IdempotencyPolicy, now: DateTime<Utc>) -> IdempotencyRecord {
    IdempotencyRecord {
        event_key: event_key.to_string(),
        status: IdempotencyStatus::Processing,
        result_summary: None,
        failure_reason: None,
        created_at: now,
        updated_at: now,
        expires_at: now + policy.processing_stale_after,
    }
}
