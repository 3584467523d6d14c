use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde_json::Value;
use shared::{IdempotencyRecord, IdempotencyStatus};

use super::{classify, processing_record, BeginOutcome, IdempotencyPolicy, IdempotencyStore};
use crate::error::IdempotencyError;
use crate::models::DbIdempotencyRecord;
use crate::schema::idempotency_records;
use crate::store::postgres::DbPool;

pub struct PgIdempotencyStore {
    pool: DbPool,
    policy: IdempotencyPolicy,
}

impl PgIdempotencyStore {
    pub fn new(pool: DbPool, policy: IdempotencyPolicy) -> Self {
        Self { pool, policy }
    }
}

fn pool_error(err: impl std::fmt::Display) -> IdempotencyError {
    IdempotencyError::Storage(format!("connection pool: {}", err))
}

fn to_row(record: &IdempotencyRecord) -> DbIdempotencyRecord {
    DbIdempotencyRecord {
        event_key: record.event_key.clone(),
        status: record.status.as_str().to_string(),
        result_summary: record.result_summary.clone(),
        failure_reason: record.failure_reason.clone(),
        created_at: record.created_at,
        updated_at: record.updated_at,
        expires_at: record.expires_at,
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn begin(&self, event_key: &str, now: DateTime<Utc>) -> Result<BeginOutcome, IdempotencyError> {
        let mut pooled = self.pool.get().await.map_err(pool_error)?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        let fresh = to_row(&processing_record(event_key, &self.policy, now));

        conn.transaction::<_, IdempotencyError, _>(|conn| {
            Box::pin(async move {
                let inserted = diesel::insert_into(idempotency_records::table)
                    .values(&fresh)
                    .on_conflict_do_nothing()
                    .execute(conn)
                    .await?;
                if inserted == 1 {
                    return Ok(BeginOutcome::Fresh);
                }

                // Someone holds the key; lock it so only one reclaimer wins.
                let existing = idempotency_records::table
                    .find(fresh.event_key.as_str())
                    .for_update()
                    .first::<DbIdempotencyRecord>(conn)
                    .await?;
                let existing = IdempotencyRecord::try_from(existing)?;

                let outcome = classify(&existing, now);
                if outcome == BeginOutcome::Fresh {
                    diesel::update(idempotency_records::table.find(fresh.event_key.as_str()))
                        .set((
                            idempotency_records::status.eq(IdempotencyStatus::Processing.as_str()),
                            idempotency_records::result_summary.eq(None::<Value>),
                            idempotency_records::failure_reason.eq(None::<String>),
                            idempotency_records::updated_at.eq(now),
                            idempotency_records::expires_at.eq(fresh.expires_at),
                        ))
                        .execute(conn)
                        .await?;
                }
                Ok(outcome)
            })
        })
        .await
    }

    async fn complete(&self, event_key: &str, result: Value, now: DateTime<Utc>) -> Result<(), IdempotencyError> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        let updated = diesel::update(
            idempotency_records::table
                .filter(idempotency_records::event_key.eq(event_key))
                .filter(idempotency_records::status.eq(IdempotencyStatus::Processing.as_str())),
        )
        .set((
            idempotency_records::status.eq(IdempotencyStatus::Completed.as_str()),
            idempotency_records::result_summary.eq(Some(result)),
            idempotency_records::updated_at.eq(now),
            idempotency_records::expires_at.eq(now + self.policy.completed_ttl),
        ))
        .execute(&mut conn)
        .await?;

        if updated == 0 {
            return Err(IdempotencyError::NotProcessing(event_key.to_string()));
        }
        Ok(())
    }

    async fn fail(&self, event_key: &str, reason: &str, now: DateTime<Utc>) -> Result<(), IdempotencyError> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        let updated = diesel::update(
            idempotency_records::table
                .filter(idempotency_records::event_key.eq(event_key))
                .filter(idempotency_records::status.eq(IdempotencyStatus::Processing.as_str())),
        )
        .set((
            idempotency_records::status.eq(IdempotencyStatus::Failed.as_str()),
            idempotency_records::failure_reason.eq(Some(reason)),
            idempotency_records::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .await?;

        if updated == 0 {
            return Err(IdempotencyError::NotProcessing(event_key.to_string()));
        }
        Ok(())
    }

    async fn get(&self, event_key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        idempotency_records::table
            .find(event_key)
            .first::<DbIdempotencyRecord>(&mut conn)
            .await
            .optional()?
            .map(IdempotencyRecord::try_from)
            .transpose()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, IdempotencyError> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        let deleted = diesel::delete(idempotency_records::table.filter(idempotency_records::expires_at.le(now)))
            .execute(&mut conn)
            .await?;

        Ok(deleted)
    }
}
