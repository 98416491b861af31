//! Raw document store with fingerprint deduplication.
//!
//! Each scraped document is keyed by the SHA-256 of its text. Re-ingesting
//! identical text is a no-op that reports `Duplicate`, which makes scraper
//! retries idempotent. URLs are unique as well: the same URL arriving with
//! different text is reported as `Conflict` and nothing is written, since
//! there is no update path for raw content.

use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Caller;
use crate::clock::Clock;
use crate::error::{LedgerError, Result};
use crate::models::RawDocument;

/// Result of an ingest call. Duplicates and conflicts are normal outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum IngestOutcome {
    Created { id: String },
    Duplicate { existing_id: String },
    Conflict { existing_id: String },
}

/// Lowercase hex SHA-256 of the document text.
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Clone)]
pub struct ContentStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl ContentStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub async fn ingest(
        &self,
        caller: &Caller,
        source: &str,
        url: &str,
        title: Option<&str>,
        text: &str,
    ) -> Result<IngestOutcome> {
        caller.require_service("content ingest")?;
        if source.trim().is_empty() {
            return Err(LedgerError::InvalidInput("source must not be empty".into()));
        }
        if url.trim().is_empty() {
            return Err(LedgerError::InvalidInput("url must not be empty".into()));
        }

        let content_hash = fingerprint(text);

        // A retention pass can delete the row we collided with between the
        // insert and the lookup; in that case the insert is simply retried.
        for _ in 0..3 {
            let id = Uuid::new_v4().to_string();
            let inserted = sqlx::query(
                r#"
                INSERT INTO raw_documents (id, source, url, title, text, content_hash, scraped_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&id)
            .bind(source)
            .bind(url)
            .bind(title)
            .bind(text)
            .bind(&content_hash)
            .bind(self.clock.now_millis())
            .execute(&self.pool)
            .await?;

            if inserted.rows_affected() == 1 {
                info!(source, url, id = %id, "raw document created");
                return Ok(IngestOutcome::Created { id });
            }

            if let Some(existing_id) = self.find_id_by_hash(&content_hash).await? {
                debug!(source, url, existing_id = %existing_id, "duplicate content skipped");
                return Ok(IngestOutcome::Duplicate { existing_id });
            }

            let by_url: Option<String> =
                sqlx::query_scalar("SELECT id FROM raw_documents WHERE url = ?")
                    .bind(url)
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some(existing_id) = by_url {
                warn!(
                    source,
                    url,
                    existing_id = %existing_id,
                    "url re-scraped with different content; rejected"
                );
                return Ok(IngestOutcome::Conflict { existing_id });
            }
        }

        Err(LedgerError::Conflict(format!(
            "could not settle ingest of {} against concurrent deletes",
            url
        )))
    }

    pub async fn get(&self, caller: &Caller, id: &str) -> Result<RawDocument> {
        caller.require_service("content read")?;
        let row = sqlx::query(
            "SELECT id, source, url, title, text, content_hash, scraped_at FROM raw_documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("raw document {}", id)))?;

        Ok(RawDocument {
            id: row.get("id"),
            source: row.get("source"),
            url: row.get("url"),
            title: row.get("title"),
            text: row.get("text"),
            content_hash: row.get("content_hash"),
            scraped_at: row.get("scraped_at"),
        })
    }

    pub async fn count(&self, source: Option<&str>) -> Result<i64> {
        let count: i64 = match source {
            Some(s) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM raw_documents WHERE source = ?")
                    .bind(s)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM raw_documents")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }

    async fn find_id_by_hash(&self, content_hash: &str) -> Result<Option<String>> {
        let id = sqlx::query_scalar("SELECT id FROM raw_documents WHERE content_hash = ?")
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }
}
