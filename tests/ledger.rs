//! End-to-end tests of the ledger operations against a real SQLite file.
//!
//! Every test runs on a `ManualClock` so day boundaries, retention windows
//! and cooldowns are deterministic.

use chrono::{Duration, TimeZone, Utc};
use quota_ledger::auth::Caller;
use quota_ledger::billing;
use quota_ledger::chat::NewMessage;
use quota_ledger::clock::{Clock, ManualClock};
use quota_ledger::config::Config;
use quota_ledger::content::IngestOutcome;
use quota_ledger::events::AccountEvent;
use quota_ledger::models::{
    JobStatus, ProcessingMetrics, SubscriptionStatus, Tier, UsageRecord,
};
use quota_ledger::profiles::ProvisionOutcome;
use quota_ledger::training::{AdvancePayload, AutoTrainOutcome, JobRequest};
use quota_ledger::{Ledger, LedgerError};
use std::sync::Arc;
use tempfile::TempDir;

const SERVICE: Caller = Caller::Service;

fn test_config(tmp: &TempDir) -> Config {
    Config::with_db_path(tmp.path().join("data").join("ledger.sqlite"))
}

fn start_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap(),
    ))
}

async fn open(cfg: &Config, clock: &Arc<ManualClock>) -> Ledger {
    let clock: Arc<dyn Clock> = clock.clone();
    Ledger::open_with_clock(cfg, clock).await.unwrap()
}

fn job(name: &str, model: &str) -> JobRequest {
    JobRequest {
        name: name.to_string(),
        model_name: model.to_string(),
        source_filter: None,
        config: serde_json::json!({}),
    }
}

fn usage(user: &str, tokens: i64) -> UsageRecord {
    UsageRecord {
        user_id: user.to_string(),
        endpoint: "/chat".to_string(),
        tokens,
        latency_ms: 120,
        status_code: 200,
    }
}

fn scored(score: f64) -> ProcessingMetrics {
    ProcessingMetrics {
        quality_score: Some(score),
        ..Default::default()
    }
}

fn completed(path: &str) -> AdvancePayload {
    AdvancePayload {
        model_path: Some(path.to_string()),
        error_message: None,
    }
}

fn failed(message: &str) -> AdvancePayload {
    AdvancePayload {
        model_path: None,
        error_message: Some(message.to_string()),
    }
}

async fn ingest(ledger: &Ledger, source: &str, url: &str, text: &str) -> String {
    match ledger
        .ingest_raw_document(&SERVICE, source, url, None, text)
        .await
        .unwrap()
    {
        IngestOutcome::Created { id } => id,
        other => panic!("expected created, got {:?}", other),
    }
}

// ─── Scenario ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_end_to_end_scenario() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let first = ledger
        .ingest_raw_document(&SERVICE, "tech_news", "u1", None, "Hello World")
        .await
        .unwrap();
    let IngestOutcome::Created { id: first_id } = first.clone() else {
        panic!("expected created, got {:?}", first);
    };
    let second = ledger
        .ingest_raw_document(&SERVICE, "tech_news", "u2", None, "Hello World")
        .await
        .unwrap();
    assert_eq!(
        second,
        IngestOutcome::Duplicate {
            existing_id: first_id.clone()
        }
    );
    assert_eq!(ledger.content().count(None).await.unwrap(), 1);

    let raw = ledger.content().get(&SERVICE, &first_id).await.unwrap();
    assert_eq!(
        raw.content_hash,
        "a591a6d40bf420404a011733cfb7b190d62c65bf0bcda32b57b277d9ad9f146e"
    );

    for tokens in [10, 20, 5] {
        ledger
            .record_api_usage(&SERVICE, &usage("U1", tokens))
            .await
            .unwrap();
    }
    let quota = ledger.get_user_quota(&SERVICE, "U1").await.unwrap();
    assert_eq!(quota.requests_today, 3);
    assert_eq!(quota.tokens_today, 35);

    let j1 = ledger
        .trigger_training_job(&SERVICE, job("job-A", "m1"))
        .await
        .unwrap();
    assert_eq!(j1.status, JobStatus::Pending);

    let again = ledger
        .trigger_training_job(&SERVICE, job("job-A2", "m1"))
        .await;
    assert!(matches!(again, Err(LedgerError::Conflict(_))));

    let done = ledger
        .advance_training_job(&SERVICE, &j1.id, JobStatus::Completed, completed("/models/m1-v2"))
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.model_path.as_deref(), Some("/models/m1-v2"));
    assert!(done.error_message.is_none());
    assert!(done.completed_at.is_some());

    let j2 = ledger
        .trigger_training_job(&SERVICE, job("job-B", "m1"))
        .await
        .unwrap();
    assert_ne!(j2.id, j1.id);
}

// ─── Content ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_url_rescraped_with_new_text_is_conflict() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let id = ingest(&ledger, "blog", "https://example.com/a", "first version").await;
    let outcome = ledger
        .ingest_raw_document(&SERVICE, "blog", "https://example.com/a", None, "second version")
        .await
        .unwrap();
    assert_eq!(outcome, IngestOutcome::Conflict { existing_id: id.clone() });

    let stored = ledger.content().get(&SERVICE, &id).await.unwrap();
    assert_eq!(stored.text, "first version");
    assert_eq!(ledger.content().count(Some("blog")).await.unwrap(), 1);
}

#[tokio::test]
async fn test_same_url_same_text_is_duplicate() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let id = ingest(&ledger, "blog", "u1", "body").await;
    let outcome = ledger
        .ingest_raw_document(&SERVICE, "blog", "u1", None, "body")
        .await
        .unwrap();
    assert_eq!(outcome, IngestOutcome::Duplicate { existing_id: id });
}

#[tokio::test]
async fn test_empty_source_rejected() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let err = ledger
        .ingest_raw_document(&SERVICE, " ", "u1", None, "body")
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidInput(_)));
}

// ─── Processing ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_processing_requires_existing_raw_document() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let err = ledger
        .record_processed_document(&SERVICE, "missing", "text", scored(0.9))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));
}

#[tokio::test]
async fn test_processing_readiness_threshold() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let good = ingest(&ledger, "news", "u1", "good text").await;
    let poor = ingest(&ledger, "news", "u2", "poor text").await;

    let recorded = ledger
        .record_processed_document(&SERVICE, &good, "good text", scored(0.6))
        .await
        .unwrap();
    assert!(recorded.document.training_ready);
    assert_eq!(
        recorded.auto_train,
        Some(AutoTrainOutcome::BelowThreshold {
            ready: 1,
            threshold: 1000
        })
    );

    let recorded = ledger
        .record_processed_document(&SERVICE, &poor, "poor text", scored(0.59))
        .await
        .unwrap();
    assert!(!recorded.document.training_ready);
    assert!(recorded.auto_train.is_none());
}

#[tokio::test]
async fn test_processing_second_record_conflicts() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let raw = ingest(&ledger, "news", "u1", "text").await;
    ledger
        .record_processed_document(&SERVICE, &raw, "text", scored(0.3))
        .await
        .unwrap();
    let err = ledger
        .record_processed_document(&SERVICE, &raw, "text again", scored(0.9))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Conflict(_)));
}

#[tokio::test]
async fn test_processing_rejects_out_of_range_score() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let raw = ingest(&ledger, "news", "u1", "text").await;
    let err = ledger
        .record_processed_document(&SERVICE, &raw, "text", scored(1.5))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidInput(_)));
}

#[tokio::test]
async fn test_processing_computes_metrics_when_absent() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let text = "The quick brown fox jumps over the lazy dog. It was not amused.";
    let raw = ingest(&ledger, "news", "u1", text).await;
    let recorded = ledger
        .record_processed_document(&SERVICE, &raw, text, ProcessingMetrics::default())
        .await
        .unwrap();
    let doc = recorded.document;
    assert_eq!(doc.word_count, 13);
    assert_eq!(doc.sentence_count, 2);
    assert!((0.0..=1.0).contains(&doc.quality_score));
}

#[tokio::test]
async fn test_mark_ready_flips_flag() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let raw = ingest(&ledger, "news", "u1", "curated").await;
    let recorded = ledger
        .record_processed_document(&SERVICE, &raw, "curated", scored(0.2))
        .await
        .unwrap();
    assert!(!recorded.document.training_ready);

    let outcome = ledger
        .mark_ready(&SERVICE, &recorded.document.id)
        .await
        .unwrap();
    assert!(matches!(outcome, Some(AutoTrainOutcome::BelowThreshold { ready: 1, .. })));

    let doc = ledger
        .get_processed_document(&SERVICE, &recorded.document.id)
        .await
        .unwrap();
    assert!(doc.training_ready);
    assert_eq!(doc.quality_score, 0.2);

    let err = ledger.mark_ready(&SERVICE, "missing").await.unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));
}

// ─── Training jobs ──────────────────────────────────────────────────

#[tokio::test]
async fn test_job_lifecycle_forward_and_failed() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let j = ledger
        .trigger_training_job(&SERVICE, job("run", "m1"))
        .await
        .unwrap();
    let started = ledger
        .advance_training_job(&SERVICE, &j.id, JobStatus::Started, AdvancePayload::default())
        .await
        .unwrap();
    assert_eq!(started.status, JobStatus::Started);
    assert!(started.started_at.is_some());

    let training = ledger
        .advance_training_job(&SERVICE, &j.id, JobStatus::Training, AdvancePayload::default())
        .await
        .unwrap();
    assert_eq!(training.status, JobStatus::Training);

    let back = ledger
        .advance_training_job(&SERVICE, &j.id, JobStatus::Started, AdvancePayload::default())
        .await;
    assert!(matches!(back, Err(LedgerError::InvalidTransition(_))));

    let same = ledger
        .advance_training_job(&SERVICE, &j.id, JobStatus::Training, AdvancePayload::default())
        .await;
    assert!(matches!(same, Err(LedgerError::InvalidTransition(_))));

    let dead = ledger
        .advance_training_job(&SERVICE, &j.id, JobStatus::Failed, failed("out of memory"))
        .await
        .unwrap();
    assert_eq!(dead.status, JobStatus::Failed);
    assert_eq!(dead.error_message.as_deref(), Some("out of memory"));
    assert!(dead.model_path.is_none());
    assert!(dead.failed_at.is_some());

    for to in [
        JobStatus::Pending,
        JobStatus::Started,
        JobStatus::Training,
        JobStatus::Completed,
    ] {
        let result = ledger
            .advance_training_job(&SERVICE, &j.id, to, completed("/models/x"))
            .await;
        assert!(
            matches!(result, Err(LedgerError::InvalidTransition(_))),
            "{} should be rejected from failed",
            to
        );
    }
}

#[tokio::test]
async fn test_terminal_payloads_required() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let j = ledger
        .trigger_training_job(&SERVICE, job("run", "m1"))
        .await
        .unwrap();
    let err = ledger
        .advance_training_job(&SERVICE, &j.id, JobStatus::Completed, AdvancePayload::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidInput(_)));

    let err = ledger
        .advance_training_job(&SERVICE, &j.id, JobStatus::Failed, failed("  "))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidInput(_)));

    let still = ledger.get_training_job(&SERVICE, &j.id).await.unwrap();
    assert_eq!(still.status, JobStatus::Pending);
}

#[tokio::test]
async fn test_advance_unknown_job_not_found() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let err = ledger
        .advance_training_job(&SERVICE, "nope", JobStatus::Started, AdvancePayload::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_yield_one_active_job() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .trigger_training_job(&Caller::Service, job(&format!("run-{}", i), "shared"))
                .await
        }));
    }

    let mut created = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(LedgerError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(conflicts, 9);

    let jobs = ledger
        .list_training_jobs(&SERVICE, Some("shared"), 100)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(ledger
        .training()
        .active_for_model("shared")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_active_jobs_are_per_model() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    ledger
        .trigger_training_job(&SERVICE, job("a", "m1"))
        .await
        .unwrap();
    clock.advance(Duration::seconds(1));
    ledger
        .trigger_training_job(&SERVICE, job("b", "m2"))
        .await
        .unwrap();

    let jobs = ledger.list_training_jobs(&SERVICE, None, 10).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].name, "b");
}

// ─── Auto-trigger ───────────────────────────────────────────────────

#[tokio::test]
async fn test_auto_trigger_threshold_active_and_cooldown() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let mut cfg = test_config(&tmp);
    cfg.auto_train.threshold = 2;
    cfg.auto_train.model_name = "auto-m".to_string();
    let ledger = open(&cfg, &clock).await;

    let mut outcomes = Vec::new();
    for i in 0..3 {
        let text = format!("document number {}", i);
        let raw = ingest(&ledger, "news", &format!("u{}", i), &text).await;
        let recorded = ledger
            .record_processed_document(&SERVICE, &raw, &text, scored(0.9))
            .await
            .unwrap();
        outcomes.push(recorded.auto_train.unwrap());
    }

    assert_eq!(
        outcomes[0],
        AutoTrainOutcome::BelowThreshold {
            ready: 1,
            threshold: 2
        }
    );
    let AutoTrainOutcome::Triggered { job_id } = &outcomes[1] else {
        panic!("expected trigger, got {:?}", outcomes[1]);
    };
    assert_eq!(outcomes[2], AutoTrainOutcome::AlreadyActive);

    let auto_job = ledger.get_training_job(&SERVICE, job_id).await.unwrap();
    assert_eq!(auto_job.model_name, "auto-m");
    assert_eq!(auto_job.source_filter.as_deref(), Some("news"));
    assert!(auto_job.name.starts_with("auto-news-"));
    assert!(auto_job.requested_by.is_none());

    ledger
        .advance_training_job(&SERVICE, job_id, JobStatus::Completed, completed("/models/auto"))
        .await
        .unwrap();

    let raw = ingest(&ledger, "news", "u3", "document number 3").await;
    let recorded = ledger
        .record_processed_document(&SERVICE, &raw, "document number 3", scored(0.9))
        .await
        .unwrap();
    assert_eq!(recorded.auto_train, Some(AutoTrainOutcome::CoolingDown));

    clock.advance(Duration::hours(25));
    let raw = ingest(&ledger, "news", "u4", "document number 4").await;
    let recorded = ledger
        .record_processed_document(&SERVICE, &raw, "document number 4", scored(0.9))
        .await
        .unwrap();
    assert!(matches!(
        recorded.auto_train,
        Some(AutoTrainOutcome::Triggered { .. })
    ));
}

#[tokio::test]
async fn test_auto_trigger_disabled() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let mut cfg = test_config(&tmp);
    cfg.auto_train.enabled = false;
    cfg.auto_train.threshold = 1;
    let ledger = open(&cfg, &clock).await;

    let raw = ingest(&ledger, "news", "u1", "text").await;
    let recorded = ledger
        .record_processed_document(&SERVICE, &raw, "text", scored(0.9))
        .await
        .unwrap();
    assert_eq!(recorded.auto_train, Some(AutoTrainOutcome::Disabled));
    assert!(ledger
        .list_training_jobs(&SERVICE, None, 10)
        .await
        .unwrap()
        .is_empty());
}

// ─── Usage and quota ────────────────────────────────────────────────

#[tokio::test]
async fn test_quota_for_unknown_user_is_zero() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let quota = ledger.get_user_quota(&SERVICE, "nobody").await.unwrap();
    assert_eq!(quota.requests_today, 0);
    assert_eq!(quota.tokens_today, 0);
    assert_eq!(quota.tier, Tier::Free);
    assert_eq!(quota.subscription_status, SubscriptionStatus::Inactive);
}

#[tokio::test]
async fn test_quota_resets_at_utc_midnight() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    ledger
        .record_api_usage(&SERVICE, &usage("U1", 100))
        .await
        .unwrap();
    clock.set(Utc.with_ymd_and_hms(2024, 6, 15, 23, 59, 59).unwrap());
    let quota = ledger.get_user_quota(&SERVICE, "U1").await.unwrap();
    assert_eq!(quota.requests_today, 1);

    clock.set(Utc.with_ymd_and_hms(2024, 6, 16, 0, 0, 0).unwrap());
    let quota = ledger.get_user_quota(&SERVICE, "U1").await.unwrap();
    assert_eq!(quota.requests_today, 0);
    assert_eq!(quota.tokens_today, 0);
}

#[tokio::test]
async fn test_quota_is_per_user() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    ledger
        .record_api_usage(&SERVICE, &usage("U1", 7))
        .await
        .unwrap();
    ledger
        .record_api_usage(&SERVICE, &usage("U2", 9))
        .await
        .unwrap();
    let quota = ledger.get_user_quota(&Caller::user("U2"), "U2").await.unwrap();
    assert_eq!(quota.requests_today, 1);
    assert_eq!(quota.tokens_today, 9);
}

#[tokio::test]
async fn test_usage_batch_and_totals() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let written = ledger
        .usage()
        .record_batch(&SERVICE, &[usage("U1", 1), usage("U1", 2), usage("U2", 3)])
        .await
        .unwrap();
    assert_eq!(written, 3);

    let totals = ledger.usage().totals(&SERVICE).await.unwrap();
    assert_eq!(totals.requests, 3);
    assert_eq!(totals.tokens, 6);
}

#[tokio::test]
async fn test_usage_rejects_negative_tokens() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let err = ledger
        .record_api_usage(&SERVICE, &usage("U1", -1))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidInput(_)));
}

#[tokio::test]
async fn test_usage_on_closed_storage_is_unavailable() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;
    ledger.close().await;

    let err = ledger
        .record_api_usage(&SERVICE, &usage("U1", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Unavailable(_)), "got {:?}", err);

    assert!(!ledger.usage().record_best_effort(&SERVICE, &usage("U1", 1)).await);
}

// ─── Retention ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_retention_prunes_old_usage_and_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    ledger
        .record_api_usage(&SERVICE, &usage("U1", 5))
        .await
        .unwrap();
    clock.advance(Duration::days(31));
    ledger
        .record_api_usage(&SERVICE, &usage("U1", 6))
        .await
        .unwrap();

    let report = ledger.run_retention_cleanup(&SERVICE).await.unwrap();
    assert_eq!(report.usage_rows_deleted, 1);

    let again = ledger.run_retention_cleanup(&SERVICE).await.unwrap();
    assert_eq!(again.usage_rows_deleted, 0);
    assert_eq!(again.jobs_deleted, 0);
    assert_eq!(again.content_rows_deleted, 0);

    let totals = ledger.usage().totals(&SERVICE).await.unwrap();
    assert_eq!(totals.requests, 1);
    assert_eq!(totals.tokens, 6);
}

#[tokio::test]
async fn test_retention_prunes_old_failed_jobs_only() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let bad = ledger
        .trigger_training_job(&SERVICE, job("bad", "m1"))
        .await
        .unwrap();
    ledger
        .advance_training_job(&SERVICE, &bad.id, JobStatus::Failed, failed("boom"))
        .await
        .unwrap();
    let good = ledger
        .trigger_training_job(&SERVICE, job("good", "m2"))
        .await
        .unwrap();
    ledger
        .advance_training_job(&SERVICE, &good.id, JobStatus::Completed, completed("/models/m2"))
        .await
        .unwrap();

    clock.advance(Duration::days(6));
    let report = ledger.run_retention_cleanup(&SERVICE).await.unwrap();
    assert_eq!(report.jobs_deleted, 0);

    clock.advance(Duration::days(2));
    let report = ledger.run_retention_cleanup(&SERVICE).await.unwrap();
    assert_eq!(report.jobs_deleted, 1);

    assert!(matches!(
        ledger.get_training_job(&SERVICE, &bad.id).await,
        Err(LedgerError::NotFound(_))
    ));
    assert!(ledger.get_training_job(&SERVICE, &good.id).await.is_ok());
}

#[tokio::test]
async fn test_retention_caps_documents_per_source() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let mut cfg = test_config(&tmp);
    cfg.retention.max_documents_per_source = 3;
    let ledger = open(&cfg, &clock).await;

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(ingest(&ledger, "a", &format!("a{}", i), &format!("a text {}", i)).await);
        clock.advance(Duration::minutes(1));
    }
    for i in 0..2 {
        ingest(&ledger, "b", &format!("b{}", i), &format!("b text {}", i)).await;
    }

    let report = ledger.run_retention_cleanup(&SERVICE).await.unwrap();
    assert_eq!(report.content_rows_deleted, 2);
    assert_eq!(ledger.content().count(Some("a")).await.unwrap(), 3);
    assert_eq!(ledger.content().count(Some("b")).await.unwrap(), 2);

    for old in &ids[..2] {
        assert!(matches!(
            ledger.content().get(&SERVICE, old).await,
            Err(LedgerError::NotFound(_))
        ));
    }
    for kept in &ids[2..] {
        assert!(ledger.content().get(&SERVICE, kept).await.is_ok());
    }
}

#[tokio::test]
async fn test_retention_keeps_ready_documents_for_active_jobs() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let mut cfg = test_config(&tmp);
    cfg.retention.max_documents_per_source = 1;
    let ledger = open(&cfg, &clock).await;

    let old = ingest(&ledger, "a", "a-old", "old but ready").await;
    let processed = ledger
        .record_processed_document(&SERVICE, &old, "old but ready", scored(0.9))
        .await
        .unwrap();
    clock.advance(Duration::minutes(1));
    ingest(&ledger, "a", "a-new", "newer").await;

    let mut request = job("covering", "m1");
    request.source_filter = Some("a".to_string());
    let active = ledger
        .trigger_training_job(&SERVICE, request)
        .await
        .unwrap();

    let report = ledger.run_retention_cleanup(&SERVICE).await.unwrap();
    assert_eq!(report.content_rows_deleted, 0);
    assert_eq!(ledger.content().count(Some("a")).await.unwrap(), 2);

    ledger
        .advance_training_job(&SERVICE, &active.id, JobStatus::Completed, completed("/models/m1"))
        .await
        .unwrap();
    let report = ledger.run_retention_cleanup(&SERVICE).await.unwrap();
    assert_eq!(report.content_rows_deleted, 1);
    assert_eq!(ledger.content().count(Some("a")).await.unwrap(), 1);

    // The processed row cascades with its raw document.
    assert!(matches!(
        ledger
            .get_processed_document(&SERVICE, &processed.document.id)
            .await,
        Err(LedgerError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_retention_guard_ignores_jobs_for_other_sources() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let mut cfg = test_config(&tmp);
    cfg.retention.max_documents_per_source = 1;
    let ledger = open(&cfg, &clock).await;

    let old = ingest(&ledger, "a", "a-old", "old but ready").await;
    ledger
        .record_processed_document(&SERVICE, &old, "old but ready", scored(0.9))
        .await
        .unwrap();
    clock.advance(Duration::minutes(1));
    ingest(&ledger, "a", "a-new", "newer").await;

    let mut request = job("elsewhere", "m1");
    request.source_filter = Some("b".to_string());
    ledger
        .trigger_training_job(&SERVICE, request)
        .await
        .unwrap();

    let report = ledger.run_retention_cleanup(&SERVICE).await.unwrap();
    assert_eq!(report.content_rows_deleted, 1);
}

// ─── Profiles, events, billing ──────────────────────────────────────

#[tokio::test]
async fn test_provisioning_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let first = ledger
        .provision_profile(&SERVICE, "U1", "u1@example.com")
        .await
        .unwrap();
    let second = ledger
        .provision_profile(&SERVICE, "U1", "other@example.com")
        .await
        .unwrap();
    assert_eq!(first, ProvisionOutcome::Created);
    assert_eq!(second, ProvisionOutcome::AlreadyExists);

    let profile = ledger
        .profiles()
        .get(&Caller::user("U1"), "U1")
        .await
        .unwrap();
    assert_eq!(profile.email, "u1@example.com");
    assert_eq!(profile.tier, Tier::Free);
    assert_eq!(profile.subscription_status, SubscriptionStatus::Inactive);
}

#[tokio::test]
async fn test_user_may_only_change_own_email() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;
    ledger
        .provision_profile(&SERVICE, "U1", "u1@example.com")
        .await
        .unwrap();

    let profiles = ledger.profiles();
    profiles
        .update_email(&Caller::user("U1"), "U1", "new@example.com")
        .await
        .unwrap();
    let profile = profiles.get(&SERVICE, "U1").await.unwrap();
    assert_eq!(profile.email, "new@example.com");

    let err = profiles
        .update_email(&Caller::user("U2"), "U1", "x@example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Forbidden(_)));

    let err = profiles
        .update_email(&Caller::user("U1"), "U1", "not-an-email")
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidInput(_)));

    let err = profiles
        .link_billing_customer(&Caller::user("U1"), "U1", "cus_1")
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Forbidden(_)));

    let err = profiles
        .update_email(&SERVICE, "ghost", "g@example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));
}

#[tokio::test]
async fn test_account_events_provision_and_delete() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let created = AccountEvent::UserCreated {
        user_id: "U1".into(),
        email: "u1@example.com".into(),
    };
    let reports = ledger.handle_account_event(&SERVICE, &created).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].handler, "profile_provisioner");
    assert_eq!(reports[0].outcome, "created");

    let redelivered = ledger.handle_account_event(&SERVICE, &created).await.unwrap();
    assert_eq!(redelivered[0].outcome, "already_exists");

    let user = Caller::user("U1");
    let session = ledger.chat().create_session(&user, "U1", None).await.unwrap();
    ledger
        .chat()
        .append_message(
            &user,
            &session.id,
            NewMessage {
                user_message: "hi".into(),
                bot_response: "hello".into(),
                tokens: 3,
                latency_ms: 40,
                model_version: None,
            },
        )
        .await
        .unwrap();
    ledger
        .record_api_usage(&SERVICE, &usage("U1", 3))
        .await
        .unwrap();

    let deleted = AccountEvent::UserDeleted {
        user_id: "U1".into(),
    };
    let reports = ledger.handle_account_event(&SERVICE, &deleted).await.unwrap();
    assert_eq!(reports[0].handler, "account_janitor");
    assert_eq!(reports[0].outcome, "deleted");

    assert!(matches!(
        ledger.profiles().get(&SERVICE, "U1").await,
        Err(LedgerError::NotFound(_))
    ));
    assert!(matches!(
        ledger.chat().list_messages(&SERVICE, &session.id, 10).await,
        Err(LedgerError::NotFound(_))
    ));
    assert_eq!(
        ledger
            .get_user_quota(&SERVICE, "U1")
            .await
            .unwrap()
            .requests_today,
        0
    );
}

#[tokio::test]
async fn test_account_events_require_service() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let event = AccountEvent::UserDeleted {
        user_id: "U2".into(),
    };
    let err = ledger
        .handle_account_event(&Caller::user("U1"), &event)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Forbidden(_)));
}

#[tokio::test]
async fn test_billing_webhook_moves_tiers() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let mut cfg = test_config(&tmp);
    cfg.billing.webhook_secret = Some("whsec_test".to_string());
    let ledger = open(&cfg, &clock).await;

    ledger
        .provision_profile(&SERVICE, "U1", "u1@example.com")
        .await
        .unwrap();
    ledger
        .profiles()
        .link_billing_customer(&SERVICE, "U1", "cus_1")
        .await
        .unwrap();

    let now = clock.now().timestamp();
    let body = br#"{"type":"customer.subscription.created","data":{"object":{"customer":"cus_1"}}}"#;
    let header = format!("t={},v1={}", now, billing::sign(body, "whsec_test", now).unwrap());
    let outcome = ledger.apply_billing_webhook(body, &header).await.unwrap();
    assert!(outcome.handled);
    assert_eq!(outcome.profiles_updated, 1);

    let profile = ledger.profiles().get(&SERVICE, "U1").await.unwrap();
    assert_eq!(profile.tier, Tier::Pro);
    assert_eq!(profile.subscription_status, SubscriptionStatus::Active);

    let body = br#"{"type":"customer.subscription.deleted","data":{"object":{"customer":"cus_1"}}}"#;
    let header = format!("t={},v1={}", now, billing::sign(body, "whsec_test", now).unwrap());
    ledger.apply_billing_webhook(body, &header).await.unwrap();
    let profile = ledger.profiles().get(&SERVICE, "U1").await.unwrap();
    assert_eq!(profile.tier, Tier::Free);
    assert_eq!(profile.subscription_status, SubscriptionStatus::Cancelled);

    let forged = format!("t={},v1={}", now, billing::sign(body, "wrong", now).unwrap());
    let err = ledger.apply_billing_webhook(body, &forged).await.unwrap_err();
    assert!(matches!(err, LedgerError::Forbidden(_)));
}

#[tokio::test]
async fn test_billing_webhook_without_secret_unavailable() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let err = ledger
        .apply_billing_webhook(b"{}", "t=0,v1=00")
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Unavailable(_)));
}

// ─── Authorization ──────────────────────────────────────────────────

#[tokio::test]
async fn test_users_cannot_touch_service_tables() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;
    let user = Caller::user("U1");

    assert!(matches!(
        ledger.ingest_raw_document(&user, "s", "u", None, "t").await,
        Err(LedgerError::Forbidden(_))
    ));
    assert!(matches!(
        ledger.record_api_usage(&user, &usage("U1", 1)).await,
        Err(LedgerError::Forbidden(_))
    ));
    assert!(matches!(
        ledger.run_retention_cleanup(&user).await,
        Err(LedgerError::Forbidden(_))
    ));
    assert!(matches!(
        ledger.get_training_stats(&user).await,
        Err(LedgerError::Forbidden(_))
    ));
    assert!(matches!(
        ledger.get_user_quota(&user, "U2").await,
        Err(LedgerError::Forbidden(_))
    ));
}

#[tokio::test]
async fn test_only_pro_users_trigger_jobs() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;
    let u1 = Caller::user("U1");

    ledger
        .provision_profile(&SERVICE, "U1", "u1@example.com")
        .await
        .unwrap();
    let err = ledger
        .trigger_training_job(&u1, job("mine", "m1"))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Forbidden(_)));

    ledger
        .profiles()
        .link_billing_customer(&SERVICE, "U1", "cus_1")
        .await
        .unwrap();
    ledger
        .profiles()
        .apply_subscription(&SERVICE, "cus_1", Some(Tier::Pro), SubscriptionStatus::Active)
        .await
        .unwrap();

    let mine = ledger
        .trigger_training_job(&u1, job("mine", "m1"))
        .await
        .unwrap();
    assert_eq!(mine.requested_by.as_deref(), Some("U1"));
    assert!(ledger.get_training_job(&u1, &mine.id).await.is_ok());
    assert!(matches!(
        ledger.get_training_job(&Caller::user("U2"), &mine.id).await,
        Err(LedgerError::Forbidden(_))
    ));
    assert!(matches!(
        ledger
            .advance_training_job(&u1, &mine.id, JobStatus::Started, AdvancePayload::default())
            .await,
        Err(LedgerError::Forbidden(_))
    ));
}

// ─── Chat ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chat_history_is_owner_scoped() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;
    let u1 = Caller::user("U1");

    let session = ledger
        .chat()
        .create_session(&u1, "U1", Some("v1"))
        .await
        .unwrap();
    for i in 0..3 {
        ledger
            .chat()
            .append_message(
                &u1,
                &session.id,
                NewMessage {
                    user_message: format!("question {}", i),
                    bot_response: format!("answer {}", i),
                    tokens: 10,
                    latency_ms: 50,
                    model_version: Some("v1".into()),
                },
            )
            .await
            .unwrap();
        clock.advance(Duration::seconds(1));
    }

    let messages = ledger
        .chat()
        .list_messages(&u1, &session.id, 2)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].user_message, "question 2");
    assert_eq!(messages[1].user_message, "question 1");

    let other = Caller::user("U2");
    assert!(matches!(
        ledger.chat().list_messages(&other, &session.id, 10).await,
        Err(LedgerError::Forbidden(_))
    ));
    assert!(matches!(
        ledger.chat().create_session(&other, "U1", None).await,
        Err(LedgerError::Forbidden(_))
    ));
    assert!(matches!(
        ledger.chat().list_messages(&u1, "missing", 10).await,
        Err(LedgerError::NotFound(_))
    ));
}

// ─── Stats ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_training_stats() {
    let tmp = TempDir::new().unwrap();
    let clock = start_clock();
    let ledger = open(&test_config(&tmp), &clock).await;

    let empty = ledger.get_training_stats(&SERVICE).await.unwrap();
    assert_eq!(empty.total_documents, 0);
    assert_eq!(empty.avg_quality_score, 0.0);
    assert!(empty.last_completed_training_at.is_none());

    let a = ingest(&ledger, "news", "u1", "alpha").await;
    let b = ingest(&ledger, "news", "u2", "beta").await;
    ingest(&ledger, "blog", "u3", "gamma").await;
    ledger
        .record_processed_document(&SERVICE, &a, "alpha", scored(0.8))
        .await
        .unwrap();
    ledger
        .record_processed_document(&SERVICE, &b, "beta", scored(0.4))
        .await
        .unwrap();

    let j = ledger
        .trigger_training_job(&SERVICE, job("run", "m1"))
        .await
        .unwrap();
    ledger
        .advance_training_job(&SERVICE, &j.id, JobStatus::Completed, completed("/models/m1"))
        .await
        .unwrap();

    let stats = ledger.get_training_stats(&SERVICE).await.unwrap();
    assert_eq!(stats.total_documents, 2);
    assert_eq!(stats.training_ready_count, 1);
    assert!((stats.avg_quality_score - 0.6).abs() < 1e-9);
    assert_eq!(stats.last_completed_training_at, Some(clock.now_millis()));

    let sources = ledger.stats().by_source(&SERVICE).await.unwrap();
    assert_eq!(sources.len(), 2);
    assert_eq!(sources[0].source, "news");
    assert_eq!(sources[0].raw, 2);
    assert_eq!(sources[0].processed, 2);
    assert_eq!(sources[0].ready, 1);
    assert_eq!(sources[1].source, "blog");
    assert_eq!(sources[1].processed, 0);
}
