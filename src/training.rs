//! Training job registry and lifecycle state machine.
//!
//! ```text
//! pending ──▶ started ──▶ training ──▶ completed
//!    │           │            │
//!    └───────────┴────────────┴──────▶ failed
//! ```
//!
//! At most one job per model may be active (pending, started or training).
//! That invariant lives in the partial unique index
//! `idx_training_jobs_active_model`: concurrent triggers for the same model
//! race on a single INSERT and all but one receive `Conflict`.
//!
//! Transitions are applied as a compare-and-set on the status the caller
//! observed, so two racing `advance` calls cannot both succeed from the same
//! starting state.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::Caller;
use crate::clock::Clock;
use crate::config::AutoTrainConfig;
use crate::error::{is_unique_violation, LedgerError, Result};
use crate::models::{JobStatus, Tier, TrainingJob};

/// Parameters of a new training job.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    pub name: String,
    pub model_name: String,
    #[serde(default)]
    pub source_filter: Option<String>,
    #[serde(default = "empty_config")]
    pub config: serde_json::Value,
}

fn empty_config() -> serde_json::Value {
    serde_json::json!({})
}

/// Terminal-state payload for [`TrainingJobRegistry::advance`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdvancePayload {
    #[serde(default)]
    pub model_path: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// What the auto-train policy did after a readiness change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AutoTrainOutcome {
    Triggered { job_id: String },
    AlreadyActive,
    BelowThreshold { ready: i64, threshold: i64 },
    CoolingDown,
    Disabled,
}

#[derive(Clone)]
pub struct TrainingJobRegistry {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    auto: AutoTrainConfig,
}

const JOB_COLUMNS: &str = "id, name, model_name, source_filter, config_json, status, model_path, \
     error_message, requested_by, created_at, started_at, completed_at, failed_at";

impl TrainingJobRegistry {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, auto: AutoTrainConfig) -> Self {
        Self { pool, clock, auto }
    }

    /// Create a pending job, or `Conflict` if the model already has an
    /// active one.
    ///
    /// Users may only trigger jobs on the pro tier; the service may always.
    pub async fn trigger(&self, caller: &Caller, request: JobRequest) -> Result<TrainingJob> {
        let requested_by = match caller {
            Caller::Service => None,
            Caller::User(user_id) => {
                self.require_pro(user_id).await?;
                Some(user_id.clone())
            }
        };

        if request.name.trim().is_empty() {
            return Err(LedgerError::InvalidInput("job name must not be empty".into()));
        }
        if request.model_name.trim().is_empty() {
            return Err(LedgerError::InvalidInput("model name must not be empty".into()));
        }

        let job = TrainingJob {
            id: Uuid::new_v4().to_string(),
            name: request.name,
            model_name: request.model_name,
            source_filter: request.source_filter,
            config: request.config,
            status: JobStatus::Pending,
            model_path: None,
            error_message: None,
            requested_by,
            created_at: self.clock.now_millis(),
            started_at: None,
            completed_at: None,
            failed_at: None,
        };

        let result = sqlx::query(
            r#"
            INSERT INTO training_jobs (id, name, model_name, source_filter, config_json, status,
                                       requested_by, created_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.name)
        .bind(&job.model_name)
        .bind(&job.source_filter)
        .bind(job.config.to_string())
        .bind(&job.requested_by)
        .bind(job.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!(id = %job.id, model = %job.model_name, name = %job.name, "training job created");
                Ok(job)
            }
            Err(e) if is_unique_violation(&e) => Err(LedgerError::Conflict(format!(
                "model {} already has an active training job",
                job.model_name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Move a job to `to`, enforcing the lifecycle ordering.
    pub async fn advance(
        &self,
        caller: &Caller,
        job_id: &str,
        to: JobStatus,
        payload: AdvancePayload,
    ) -> Result<TrainingJob> {
        caller.require_service("training job transitions")?;

        let current = self.fetch(job_id).await?;
        if !current.status.can_advance_to(to) {
            return Err(LedgerError::InvalidTransition(format!(
                "job {}: {} -> {}",
                job_id, current.status, to
            )));
        }

        let now = self.clock.now_millis();
        let from = current.status.as_str();
        let result = match to {
            JobStatus::Completed => {
                let path = non_empty(payload.model_path).ok_or_else(|| {
                    LedgerError::InvalidInput("completed jobs require a model_path".into())
                })?;
                sqlx::query(
                    "UPDATE training_jobs SET status = 'completed', model_path = ?, completed_at = ? WHERE id = ? AND status = ?",
                )
                .bind(path)
                .bind(now)
                .bind(job_id)
                .bind(from)
                .execute(&self.pool)
                .await?
            }
            JobStatus::Failed => {
                let message = non_empty(payload.error_message).ok_or_else(|| {
                    LedgerError::InvalidInput("failed jobs require an error_message".into())
                })?;
                sqlx::query(
                    "UPDATE training_jobs SET status = 'failed', error_message = ?, failed_at = ? WHERE id = ? AND status = ?",
                )
                .bind(message)
                .bind(now)
                .bind(job_id)
                .bind(from)
                .execute(&self.pool)
                .await?
            }
            JobStatus::Started | JobStatus::Training => {
                sqlx::query(
                    "UPDATE training_jobs SET status = ?, started_at = COALESCE(started_at, ?) WHERE id = ? AND status = ?",
                )
                .bind(to.as_str())
                .bind(now)
                .bind(job_id)
                .bind(from)
                .execute(&self.pool)
                .await?
            }
            JobStatus::Pending => {
                return Err(LedgerError::InvalidTransition(format!(
                    "job {}: nothing re-enters pending",
                    job_id
                )));
            }
        };

        if result.rows_affected() == 0 {
            let latest = self.fetch(job_id).await?;
            return Err(LedgerError::InvalidTransition(format!(
                "job {} moved to {} concurrently; {} -> {} not applied",
                job_id, latest.status, current.status, to
            )));
        }

        info!(id = job_id, from, to = %to, "training job advanced");
        self.fetch(job_id).await
    }

    pub async fn get(&self, caller: &Caller, job_id: &str) -> Result<TrainingJob> {
        let job = self.fetch(job_id).await?;
        match caller {
            Caller::Service => Ok(job),
            Caller::User(user_id) if job.requested_by.as_deref() == Some(user_id.as_str()) => {
                Ok(job)
            }
            Caller::User(user_id) => Err(LedgerError::Forbidden(format!(
                "user {} did not request job {}",
                user_id, job_id
            ))),
        }
    }

    /// Newest first, optionally restricted to one model.
    pub async fn list(
        &self,
        caller: &Caller,
        model_name: Option<&str>,
        limit: i64,
    ) -> Result<Vec<TrainingJob>> {
        caller.require_service("training job listing")?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM training_jobs WHERE (? IS NULL OR model_name = ?) ORDER BY created_at DESC, rowid DESC LIMIT ?",
            JOB_COLUMNS
        ))
        .bind(model_name)
        .bind(model_name)
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    pub async fn active_for_model(&self, model_name: &str) -> Result<Option<TrainingJob>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM training_jobs WHERE model_name = ? AND status IN ('pending', 'started', 'training')",
            JOB_COLUMNS
        ))
        .bind(model_name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// Apply the auto-train policy after `ready_count` documents from
    /// `source` became training-ready.
    ///
    /// Never an error for an already-active model: the trigger is dropped,
    /// not queued.
    pub async fn maybe_auto_trigger(&self, source: &str, ready_count: i64) -> Result<AutoTrainOutcome> {
        if !self.auto.enabled {
            return Ok(AutoTrainOutcome::Disabled);
        }
        if ready_count < self.auto.threshold {
            return Ok(AutoTrainOutcome::BelowThreshold {
                ready: ready_count,
                threshold: self.auto.threshold,
            });
        }

        let model = self.auto.model_name.as_str();
        if self.active_for_model(model).await?.is_some() {
            debug!(model, source, "auto-train skipped: job already active");
            return Ok(AutoTrainOutcome::AlreadyActive);
        }

        let last_created: Option<i64> =
            sqlx::query_scalar("SELECT MAX(created_at) FROM training_jobs WHERE model_name = ?")
                .bind(model)
                .fetch_one(&self.pool)
                .await?;
        let cooldown = Duration::hours(self.auto.cooldown_hours).num_milliseconds();
        let now = self.clock.now_millis();
        if let Some(last) = last_created {
            if now - last < cooldown {
                debug!(model, source, "auto-train skipped: cooling down");
                return Ok(AutoTrainOutcome::CoolingDown);
            }
        }

        let request = JobRequest {
            name: format!("auto-{}-{}", source, now / 1000),
            model_name: model.to_string(),
            source_filter: Some(source.to_string()),
            config: serde_json::json!({ "trigger": "auto", "ready_documents": ready_count }),
        };
        match self.trigger(&Caller::Service, request).await {
            Ok(job) => Ok(AutoTrainOutcome::Triggered { job_id: job.id }),
            Err(LedgerError::Conflict(_)) => Ok(AutoTrainOutcome::AlreadyActive),
            Err(e) => Err(e),
        }
    }

    async fn require_pro(&self, user_id: &str) -> Result<()> {
        let tier: Option<String> =
            sqlx::query_scalar("SELECT tier FROM user_profiles WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        match tier.as_deref().map(str::parse::<Tier>).transpose()? {
            Some(Tier::Pro) => Ok(()),
            _ => Err(LedgerError::Forbidden(format!(
                "user {} must be on the pro tier to trigger training",
                user_id
            ))),
        }
    }

    async fn fetch(&self, job_id: &str) -> Result<TrainingJob> {
        let row = sqlx::query(&format!("SELECT {} FROM training_jobs WHERE id = ?", JOB_COLUMNS))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("training job {}", job_id)))?;
        job_from_row(&row)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn job_from_row(row: &SqliteRow) -> Result<TrainingJob> {
    let status: String = row.get("status");
    let config_json: String = row.get("config_json");
    Ok(TrainingJob {
        id: row.get("id"),
        name: row.get("name"),
        model_name: row.get("model_name"),
        source_filter: row.get("source_filter"),
        config: serde_json::from_str(&config_json).unwrap_or_else(|_| empty_config()),
        status: status.parse()?,
        model_path: row.get("model_path"),
        error_message: row.get("error_message"),
        requested_by: row.get("requested_by"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        failed_at: row.get("failed_at"),
    })
}
