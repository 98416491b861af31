//! Training corpus statistics.
//!
//! A quick summary of what has been scraped and processed: raw and
//! processed document counts, how many are training-ready, average quality,
//! and when a training job last completed. Used by `qledger stats` and
//! `GET /training/stats`.

use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::auth::Caller;
use crate::config::Config;
use crate::error::Result;
use crate::ledger::Ledger;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingStats {
    /// Processed documents.
    pub total_documents: i64,
    pub training_ready_count: i64,
    pub avg_quality_score: f64,
    pub last_completed_training_at: Option<i64>,
}

/// Per-source breakdown of raw and processed documents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStats {
    pub source: String,
    pub raw: i64,
    pub processed: i64,
    pub ready: i64,
    pub avg_quality: f64,
}

#[derive(Clone)]
pub struct StatsReader {
    pool: SqlitePool,
}

impl StatsReader {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn training_stats(&self, caller: &Caller) -> Result<TrainingStats> {
        caller.require_service("training statistics")?;

        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(training_ready), 0) AS ready,
                COALESCE(AVG(quality_score), 0.0) AS avg_quality
            FROM processed_documents
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let last_completed: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(completed_at) FROM training_jobs WHERE status = 'completed'",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(TrainingStats {
            total_documents: row.get("total"),
            training_ready_count: row.get("ready"),
            avg_quality_score: row.get("avg_quality"),
            last_completed_training_at: last_completed,
        })
    }

    pub async fn by_source(&self, caller: &Caller) -> Result<Vec<SourceStats>> {
        caller.require_service("training statistics")?;

        let rows = sqlx::query(
            r#"
            SELECT
                r.source,
                COUNT(r.id) AS raw,
                COUNT(p.id) AS processed,
                COALESCE(SUM(p.training_ready), 0) AS ready,
                COALESCE(AVG(p.quality_score), 0.0) AS avg_quality
            FROM raw_documents r
            LEFT JOIN processed_documents p ON p.raw_id = r.id
            GROUP BY r.source
            ORDER BY raw DESC, r.source
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| SourceStats {
                source: row.get("source"),
                raw: row.get("raw"),
                processed: row.get("processed"),
                ready: row.get("ready"),
                avg_quality: row.get("avg_quality"),
            })
            .collect())
    }
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> anyhow::Result<()> {
    let ledger = Ledger::open(config).await?;
    let stats = ledger.get_training_stats(&Caller::Service).await?;
    let sources = ledger.stats().by_source(&Caller::Service).await?;
    let usage = ledger.usage().totals(&Caller::Service).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Quota Ledger: Training Stats");
    println!("============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Processed:   {}", stats.total_documents);
    println!(
        "  Ready:       {} / {} ({}%)",
        stats.training_ready_count,
        stats.total_documents,
        if stats.total_documents > 0 {
            (stats.training_ready_count * 100) / stats.total_documents
        } else {
            0
        }
    );
    println!("  Avg quality: {:.3}", stats.avg_quality_score);
    println!(
        "  Last train:  {}",
        match stats.last_completed_training_at {
            Some(ms) => format_ts_relative(ms / 1000),
            None => "never".to_string(),
        }
    );
    println!();
    println!("  API calls:   {}", usage.requests);
    println!("  Tokens:      {}", usage.tokens);

    if !sources.is_empty() {
        println!();
        println!("  By source:");
        println!(
            "  {:<24} {:>8} {:>10} {:>8} {:>8}",
            "SOURCE", "RAW", "PROCESSED", "READY", "QUALITY"
        );
        println!("  {}", "-".repeat(64));

        for s in &sources {
            println!(
                "  {:<24} {:>8} {:>10} {:>8} {:>8.3}",
                s.source, s.raw, s.processed, s.ready, s.avg_quality
            );
        }
    }

    println!();

    ledger.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp (seconds) as a relative time string
/// (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
