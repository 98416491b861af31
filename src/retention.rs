//! Bounded-retention cleanup.
//!
//! One pass, one transaction:
//!
//! 1. usage rows older than `usage_days`;
//! 2. failed jobs older than `failed_job_days` (completed jobs carry a
//!    model path and are kept);
//! 3. raw documents beyond the newest `max_documents_per_source` per
//!    source, except training-ready documents whose source is covered by
//!    an active training job. Processed rows cascade with their raw row.
//!
//! Every delete is a predicate over the current snapshot, so re-running a
//! pass, or running two at once, removes nothing extra.

use chrono::Duration;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::Caller;
use crate::clock::Clock;
use crate::config::RetentionConfig;
use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub usage_rows_deleted: u64,
    pub jobs_deleted: u64,
    pub content_rows_deleted: u64,
}

#[derive(Clone)]
pub struct RetentionJanitor {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    config: RetentionConfig,
}

impl RetentionJanitor {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, config: RetentionConfig) -> Self {
        Self {
            pool,
            clock,
            config,
        }
    }

    pub async fn run_cleanup(&self, caller: &Caller) -> Result<CleanupReport> {
        caller.require_service("retention cleanup")?;

        let now = self.clock.now_millis();
        let usage_cutoff = now - Duration::days(self.config.usage_days).num_milliseconds();
        let job_cutoff = now - Duration::days(self.config.failed_job_days).num_milliseconds();

        let mut tx = self.pool.begin().await?;

        let usage_rows_deleted = sqlx::query("DELETE FROM api_usage WHERE created_at < ?")
            .bind(usage_cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let jobs_deleted = sqlx::query(
            "DELETE FROM training_jobs WHERE status = 'failed' AND COALESCE(failed_at, created_at) < ?",
        )
        .bind(job_cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let content_rows_deleted = sqlx::query(
            r#"
            DELETE FROM raw_documents
            WHERE id IN (
                SELECT id FROM (
                    SELECT id, ROW_NUMBER() OVER (
                        PARTITION BY source ORDER BY scraped_at DESC, rowid DESC
                    ) AS rn
                    FROM raw_documents
                )
                WHERE rn > ?
            )
            AND id NOT IN (
                SELECT p.raw_id
                FROM processed_documents p
                JOIN raw_documents r ON r.id = p.raw_id
                WHERE p.training_ready = 1
                  AND EXISTS (
                      SELECT 1 FROM training_jobs j
                      WHERE j.status IN ('pending', 'started', 'training')
                        AND (j.source_filter IS NULL OR j.source_filter = r.source)
                  )
            )
            "#,
        )
        .bind(self.config.max_documents_per_source)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        let report = CleanupReport {
            usage_rows_deleted,
            jobs_deleted,
            content_rows_deleted,
        };
        info!(
            usage_rows = report.usage_rows_deleted,
            jobs = report.jobs_deleted,
            content_rows = report.content_rows_deleted,
            "retention cleanup finished"
        );
        Ok(report)
    }

    /// Run a cleanup pass every `interval`, starting after the first tick.
    /// A failed pass is logged and retried on the next tick.
    pub fn spawn_schedule(self, interval: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_cleanup(&Caller::Service).await {
                    warn!(error = %e, "retention cleanup failed; retrying next interval");
                }
            }
        })
    }
}
