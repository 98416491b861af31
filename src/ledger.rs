//! The ledger facade.
//!
//! [`Ledger`] wires every component to one pool and one clock and exposes
//! the externally invoked operations. It is cheap to clone; the CLI and the
//! HTTP server both drive it.
//!
//! Readiness changes feed the auto-train policy here rather than inside
//! [`ProcessingLedger`], so the processing ledger stays unaware of jobs.

use anyhow::Context;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::warn;

use crate::auth::Caller;
use crate::billing;
use crate::chat::ChatHistory;
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, QuotaConfig};
use crate::content::{ContentStore, IngestOutcome};
use crate::db;
use crate::error::{LedgerError, Result};
use crate::events::{AccountEvent, EventRegistry, HandlerReport};
use crate::migrate;
use crate::models::{JobStatus, ProcessedDocument, ProcessingMetrics, TrainingJob, UsageRecord};
use crate::processing::ProcessingLedger;
use crate::profiles::{ProfileStore, ProvisionOutcome};
use crate::quota::{Quota, QuotaService};
use crate::retention::{CleanupReport, RetentionJanitor};
use crate::stats::{StatsReader, TrainingStats};
use crate::training::{AdvancePayload, AutoTrainOutcome, JobRequest, TrainingJobRegistry};
use crate::usage::UsageMeter;

/// A recorded processed document and what the auto-train policy did.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedDocument {
    pub document: ProcessedDocument,
    /// `None` when the document is not training-ready or the policy check
    /// failed (logged).
    pub auto_train: Option<AutoTrainOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WebhookOutcome {
    pub handled: bool,
    pub profiles_updated: u64,
}

#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
    content: ContentStore,
    processing: ProcessingLedger,
    training: TrainingJobRegistry,
    usage: UsageMeter,
    quota: QuotaService,
    retention: RetentionJanitor,
    profiles: ProfileStore,
    chat: ChatHistory,
    stats: StatsReader,
    events: Arc<EventRegistry>,
}

impl Ledger {
    /// Connect, apply the schema, and build every component on the system
    /// clock.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(config: &Config, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let pool = db::connect(config)
            .await
            .with_context(|| format!("Failed to open database: {}", config.db.path.display()))?;
        migrate::apply_schema(&pool)
            .await
            .context("Failed to apply schema")?;
        Ok(Self::from_pool(pool, config.clone(), clock))
    }

    /// Build on an existing pool whose schema is already applied.
    pub fn from_pool(pool: SqlitePool, config: Config, clock: Arc<dyn Clock>) -> Self {
        let content = ContentStore::new(pool.clone(), clock.clone());
        let processing =
            ProcessingLedger::new(pool.clone(), clock.clone(), config.processing.clone());
        let training =
            TrainingJobRegistry::new(pool.clone(), clock.clone(), config.auto_train.clone());
        let usage = UsageMeter::new(pool.clone(), clock.clone());
        let profiles = ProfileStore::new(pool.clone(), clock.clone());
        let quota = QuotaService::new(profiles.clone(), usage.clone(), clock.clone());
        let retention =
            RetentionJanitor::new(pool.clone(), clock.clone(), config.retention.clone());
        let chat = ChatHistory::new(pool.clone(), clock.clone());
        let stats = StatsReader::new(pool.clone());
        let events = Arc::new(EventRegistry::with_builtins(profiles.clone()));

        Self {
            pool,
            clock,
            config: Arc::new(config),
            content,
            processing,
            training,
            usage,
            quota,
            retention,
            profiles,
            chat,
            stats,
            events,
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn quota_limits(&self) -> &QuotaConfig {
        &self.config.quota
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn processing(&self) -> &ProcessingLedger {
        &self.processing
    }

    pub fn training(&self) -> &TrainingJobRegistry {
        &self.training
    }

    pub fn usage(&self) -> &UsageMeter {
        &self.usage
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    pub fn retention(&self) -> &RetentionJanitor {
        &self.retention
    }

    pub fn chat(&self) -> &ChatHistory {
        &self.chat
    }

    pub fn stats(&self) -> &StatsReader {
        &self.stats
    }

    pub async fn ingest_raw_document(
        &self,
        caller: &Caller,
        source: &str,
        url: &str,
        title: Option<&str>,
        text: &str,
    ) -> Result<IngestOutcome> {
        self.content.ingest(caller, source, url, title, text).await
    }

    pub async fn record_processed_document(
        &self,
        caller: &Caller,
        raw_id: &str,
        cleaned_text: &str,
        metrics: ProcessingMetrics,
    ) -> Result<RecordedDocument> {
        let document = self
            .processing
            .record(caller, raw_id, cleaned_text, metrics)
            .await?;
        let auto_train = if document.training_ready {
            self.auto_train_after_readiness(&document.source).await
        } else {
            None
        };
        Ok(RecordedDocument {
            document,
            auto_train,
        })
    }

    pub async fn mark_ready(
        &self,
        caller: &Caller,
        processed_id: &str,
    ) -> Result<Option<AutoTrainOutcome>> {
        let source = self.processing.mark_ready(caller, processed_id).await?;
        Ok(self.auto_train_after_readiness(&source).await)
    }

    pub async fn get_processed_document(
        &self,
        caller: &Caller,
        processed_id: &str,
    ) -> Result<ProcessedDocument> {
        self.processing.get(caller, processed_id).await
    }

    pub async fn get_training_stats(&self, caller: &Caller) -> Result<TrainingStats> {
        self.stats.training_stats(caller).await
    }

    pub async fn trigger_training_job(
        &self,
        caller: &Caller,
        request: JobRequest,
    ) -> Result<TrainingJob> {
        self.training.trigger(caller, request).await
    }

    pub async fn advance_training_job(
        &self,
        caller: &Caller,
        job_id: &str,
        to: JobStatus,
        payload: AdvancePayload,
    ) -> Result<TrainingJob> {
        self.training.advance(caller, job_id, to, payload).await
    }

    pub async fn get_training_job(&self, caller: &Caller, job_id: &str) -> Result<TrainingJob> {
        self.training.get(caller, job_id).await
    }

    pub async fn list_training_jobs(
        &self,
        caller: &Caller,
        model_name: Option<&str>,
        limit: i64,
    ) -> Result<Vec<TrainingJob>> {
        self.training.list(caller, model_name, limit).await
    }

    pub async fn get_user_quota(&self, caller: &Caller, user_id: &str) -> Result<Quota> {
        self.quota.get_quota(caller, user_id).await
    }

    pub async fn record_api_usage(&self, caller: &Caller, record: &UsageRecord) -> Result<()> {
        self.usage.record(caller, record).await
    }

    pub async fn run_retention_cleanup(&self, caller: &Caller) -> Result<CleanupReport> {
        self.retention.run_cleanup(caller).await
    }

    pub async fn provision_profile(
        &self,
        caller: &Caller,
        user_id: &str,
        email: &str,
    ) -> Result<ProvisionOutcome> {
        self.profiles.provision(caller, user_id, email).await
    }

    /// Verify and apply a billing provider delivery.
    ///
    /// The signature is the credential here; there is no caller identity.
    pub async fn apply_billing_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<WebhookOutcome> {
        let secret = self.config.billing.webhook_secret.as_deref().ok_or_else(|| {
            LedgerError::Unavailable("billing webhook secret is not configured".into())
        })?;
        billing::verify_signature(
            payload,
            signature,
            secret,
            self.clock.now().timestamp(),
            self.config.billing.tolerance_secs,
        )?;

        let Some(change) = billing::parse_event(payload)? else {
            return Ok(WebhookOutcome {
                handled: false,
                profiles_updated: 0,
            });
        };
        let profiles_updated = self
            .profiles
            .apply_subscription(&Caller::Service, &change.customer_id, change.tier, change.status)
            .await?;
        Ok(WebhookOutcome {
            handled: true,
            profiles_updated,
        })
    }

    pub async fn handle_account_event(
        &self,
        caller: &Caller,
        event: &AccountEvent,
    ) -> Result<Vec<HandlerReport>> {
        caller.require_service("account events")?;
        self.events.dispatch(event).await
    }

    async fn auto_train_after_readiness(&self, source: &str) -> Option<AutoTrainOutcome> {
        let result: Result<AutoTrainOutcome> = async {
            let ready = self.processing.ready_count(Some(source)).await?;
            self.training.maybe_auto_trigger(source, ready).await
        }
        .await;
        match result {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(source, error = %e, "auto-train check failed");
                None
            }
        }
    }
}
