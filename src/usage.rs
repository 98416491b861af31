//! Append-only API usage log.
//!
//! Rows are never updated. Quota figures are always aggregated from this
//! log on read; there is no running counter to drift out of sync.

use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::warn;

use crate::auth::Caller;
use crate::clock::Clock;
use crate::error::{LedgerError, Result};
use crate::models::UsageRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub requests: i64,
    pub tokens: i64,
}

#[derive(Clone)]
pub struct UsageMeter {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl UsageMeter {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub async fn record(&self, caller: &Caller, record: &UsageRecord) -> Result<()> {
        caller.require_service("usage recording")?;
        validate(record)?;

        sqlx::query(
            "INSERT INTO api_usage (user_id, endpoint, tokens_used, latency_ms, status_code, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.user_id)
        .bind(&record.endpoint)
        .bind(record.tokens)
        .bind(record.latency_ms)
        .bind(record.status_code)
        .bind(self.clock.now_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Write a buffered batch in one transaction: all rows or none.
    pub async fn record_batch(&self, caller: &Caller, records: &[UsageRecord]) -> Result<u64> {
        caller.require_service("usage recording")?;
        for record in records {
            validate(record)?;
        }

        let now = self.clock.now_millis();
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                "INSERT INTO api_usage (user_id, endpoint, tokens_used, latency_ms, status_code, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&record.user_id)
            .bind(&record.endpoint)
            .bind(record.tokens)
            .bind(record.latency_ms)
            .bind(record.status_code)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(records.len() as u64)
    }

    /// Record without failing the request path. Returns whether the row
    /// was written; failures are logged.
    pub async fn record_best_effort(&self, caller: &Caller, record: &UsageRecord) -> bool {
        match self.record(caller, record).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    user_id = %record.user_id,
                    endpoint = %record.endpoint,
                    error = %e,
                    "failed to record api usage"
                );
                false
            }
        }
    }

    /// Requests and tokens for one user at or after `since_millis`.
    pub async fn totals_since(&self, user_id: &str, since_millis: i64) -> Result<UsageTotals> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS requests, COALESCE(SUM(tokens_used), 0) AS tokens FROM api_usage WHERE user_id = ? AND created_at >= ?",
        )
        .bind(user_id)
        .bind(since_millis)
        .fetch_one(&self.pool)
        .await?;

        Ok(UsageTotals {
            requests: row.get("requests"),
            tokens: row.get("tokens"),
        })
    }

    /// All-time totals across every user.
    pub async fn totals(&self, caller: &Caller) -> Result<UsageTotals> {
        caller.require_service("global usage totals")?;
        let row = sqlx::query(
            "SELECT COUNT(*) AS requests, COALESCE(SUM(tokens_used), 0) AS tokens FROM api_usage",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(UsageTotals {
            requests: row.get("requests"),
            tokens: row.get("tokens"),
        })
    }
}

fn validate(record: &UsageRecord) -> Result<()> {
    if record.user_id.trim().is_empty() {
        return Err(LedgerError::InvalidInput("user_id must not be empty".into()));
    }
    if record.endpoint.trim().is_empty() {
        return Err(LedgerError::InvalidInput("endpoint must not be empty".into()));
    }
    if record.tokens < 0 || record.latency_ms < 0 {
        return Err(LedgerError::InvalidInput(
            "tokens and latency_ms must be >= 0".into(),
        ));
    }
    Ok(())
}
