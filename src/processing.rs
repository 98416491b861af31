//! Ledger of cleaned, scored documents derived from raw ones.
//!
//! One processed row per raw document. Its derived fields are fixed at
//! creation; only `training_ready` may later flip to true.

use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::auth::Caller;
use crate::clock::Clock;
use crate::config::ProcessingConfig;
use crate::error::{is_unique_violation, LedgerError, Result};
use crate::models::{ProcessedDocument, ProcessingMetrics};
use crate::quality;

#[derive(Clone)]
pub struct ProcessingLedger {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    config: ProcessingConfig,
}

impl ProcessingLedger {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, config: ProcessingConfig) -> Self {
        Self {
            pool,
            clock,
            config,
        }
    }

    pub async fn record(
        &self,
        caller: &Caller,
        raw_id: &str,
        cleaned_text: &str,
        metrics: ProcessingMetrics,
    ) -> Result<ProcessedDocument> {
        caller.require_service("processing ledger")?;

        let source: String = sqlx::query_scalar("SELECT source FROM raw_documents WHERE id = ?")
            .bind(raw_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("raw document {}", raw_id)))?;

        let computed = quality::analyze(cleaned_text);
        let quality_score = metrics
            .quality_score
            .unwrap_or_else(|| quality::quality_score(&computed));
        if !quality_score.is_finite() || !(0.0..=1.0).contains(&quality_score) {
            return Err(LedgerError::InvalidInput(format!(
                "quality_score must be in [0, 1], got {}",
                quality_score
            )));
        }

        let doc = ProcessedDocument {
            id: Uuid::new_v4().to_string(),
            source,
            raw_id: raw_id.to_string(),
            cleaned_text: cleaned_text.to_string(),
            word_count: metrics.word_count.unwrap_or(computed.word_count),
            sentence_count: metrics.sentence_count.unwrap_or(computed.sentence_count),
            quality_score,
            readability_score: metrics.readability_score.unwrap_or(computed.readability),
            vocabulary_diversity: metrics
                .vocabulary_diversity
                .unwrap_or(computed.vocabulary_diversity),
            training_ready: self.is_ready(quality_score, metrics.tokens.len()),
            tokens: metrics.tokens,
            processed_at: self.clock.now_millis(),
        };

        let tokens_json = serde_json::to_string(&doc.tokens)
            .map_err(|e| LedgerError::InvalidInput(format!("tokens: {}", e)))?;

        let result = sqlx::query(
            r#"
            INSERT INTO processed_documents (id, source, raw_id, cleaned_text, tokens_json,
                                             word_count, sentence_count, quality_score,
                                             readability_score, vocabulary_diversity,
                                             training_ready, processed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.source)
        .bind(&doc.raw_id)
        .bind(&doc.cleaned_text)
        .bind(&tokens_json)
        .bind(doc.word_count)
        .bind(doc.sentence_count)
        .bind(doc.quality_score)
        .bind(doc.readability_score)
        .bind(doc.vocabulary_diversity)
        .bind(doc.training_ready)
        .bind(doc.processed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(LedgerError::Conflict(format!(
                    "raw document {} already has a processed record",
                    raw_id
                )));
            }
            Err(e) if is_foreign_key_violation(&e) => {
                return Err(LedgerError::NotFound(format!("raw document {}", raw_id)));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            id = %doc.id,
            raw_id,
            source = %doc.source,
            quality = doc.quality_score,
            ready = doc.training_ready,
            "processed document recorded"
        );
        Ok(doc)
    }

    /// Flip a document to training-ready without rescoring.
    ///
    /// Returns the document's source so the caller can re-evaluate the
    /// auto-train policy.
    pub async fn mark_ready(&self, caller: &Caller, processed_id: &str) -> Result<String> {
        caller.require_service("processing ledger")?;

        let source: Option<String> = sqlx::query_scalar(
            "UPDATE processed_documents SET training_ready = 1 WHERE id = ? RETURNING source",
        )
        .bind(processed_id)
        .fetch_optional(&self.pool)
        .await?;

        let source =
            source.ok_or_else(|| LedgerError::NotFound(format!("processed document {}", processed_id)))?;
        info!(id = processed_id, source = %source, "processed document marked ready");
        Ok(source)
    }

    pub async fn get(&self, caller: &Caller, processed_id: &str) -> Result<ProcessedDocument> {
        caller.require_service("processing ledger")?;

        let row = sqlx::query(
            r#"
            SELECT id, source, raw_id, cleaned_text, tokens_json, word_count, sentence_count,
                   quality_score, readability_score, vocabulary_diversity, training_ready,
                   processed_at
            FROM processed_documents WHERE id = ?
            "#,
        )
        .bind(processed_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("processed document {}", processed_id)))?;

        let tokens_json: String = row.get("tokens_json");
        Ok(ProcessedDocument {
            id: row.get("id"),
            source: row.get("source"),
            raw_id: row.get("raw_id"),
            cleaned_text: row.get("cleaned_text"),
            tokens: serde_json::from_str(&tokens_json).unwrap_or_default(),
            word_count: row.get("word_count"),
            sentence_count: row.get("sentence_count"),
            quality_score: row.get("quality_score"),
            readability_score: row.get("readability_score"),
            vocabulary_diversity: row.get("vocabulary_diversity"),
            training_ready: row.get("training_ready"),
            processed_at: row.get("processed_at"),
        })
    }

    pub async fn ready_count(&self, source: Option<&str>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM processed_documents WHERE training_ready = 1 AND (? IS NULL OR source = ?)",
        )
        .bind(source)
        .bind(source)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    fn is_ready(&self, quality_score: f64, token_count: usize) -> bool {
        quality_score >= self.config.quality_threshold && token_count >= self.config.min_tokens
    }
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_foreign_key_violation())
        .unwrap_or(false)
}
