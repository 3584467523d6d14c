use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::{IdempotencyRecord, IdempotencyStatus};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{classify, processing_record, BeginOutcome, IdempotencyPolicy, IdempotencyStore};
use crate::error::IdempotencyError;

pub struct InMemoryIdempotencyStore {
    policy: IdempotencyPolicy,
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new(policy: IdempotencyPolicy) -> Self {
        Self {
            policy,
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new(IdempotencyPolicy::default())
    }
}

fn processing_mut<'a>(
    records: &'a mut HashMap<String, IdempotencyRecord>,
    event_key: &str,
) -> Result<&'a mut IdempotencyRecord, IdempotencyError> {
    records
        .get_mut(event_key)
        .filter(|r| r.status == IdempotencyStatus::Processing)
        .ok_or_else(|| IdempotencyError::NotProcessing(event_key.to_string()))
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn begin(&self, event_key: &str, now: DateTime<Utc>) -> Result<BeginOutcome, IdempotencyError> {
        let mut records = self.records.lock().await;

        if let Some(existing) = records.get(event_key) {
            let outcome = classify(existing, now);
            if outcome != BeginOutcome::Fresh {
                return Ok(outcome);
            }
        }

        records.insert(event_key.to_string(), processing_record(event_key, &self.policy, now));
        Ok(BeginOutcome::Fresh)
    }

    async fn complete(&self, event_key: &str, result: Value, now: DateTime<Utc>) -> Result<(), IdempotencyError> {
        let mut records = self.records.lock().await;
        let record = processing_mut(&mut records, event_key)?;

        record.status = IdempotencyStatus::Completed;
        record.result_summary = Some(result);
        record.updated_at = now;
        record.expires_at = now + self.policy.completed_ttl;
        Ok(())
    }

    async fn fail(&self, event_key: &str, reason: &str, now: DateTime<Utc>) -> Result<(), IdempotencyError> {
        let mut records = self.records.lock().await;
        let record = processing_mut(&mut records, event_key)?;

        record.status = IdempotencyStatus::Failed;
        record.failure_reason = Some(reason.to_string());
        record.updated_at = now;
        Ok(())
    }

    async fn get(&self, event_key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        Ok(self.records.lock().await.get(event_key).cloned())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, IdempotencyError> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| r.expires_at > now);
        Ok(before - records.len())
    }
}
