//! CLI command implementations.
//!
//! Each `run_*` function opens the ledger, performs one operation as the
//! trusted service identity, and prints a plain-text report. Expected
//! outcomes (duplicates, skipped auto-train) are printed; errors propagate
//! to `main` and exit non-zero.

use anyhow::{Context, Result};
use std::path::Path;

use crate::auth::Caller;
use crate::config::Config;
use crate::content::IngestOutcome;
use crate::ledger::Ledger;
use crate::models::{JobStatus, ProcessingMetrics, UsageRecord};
use crate::profiles::ProvisionOutcome;
use crate::quota::QuotaDecision;
use crate::training::{AdvancePayload, AutoTrainOutcome, JobRequest};

/// Document text given inline or read from a file.
pub fn read_text(text: Option<String>, file: Option<&Path>) -> Result<String> {
    match (text, file) {
        (Some(text), None) => Ok(text),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        (Some(_), Some(_)) => anyhow::bail!("pass either --text or --file, not both"),
        (None, None) => anyhow::bail!("one of --text or --file is required"),
    }
}

pub async fn run_ingest(
    config: &Config,
    source: &str,
    url: &str,
    title: Option<&str>,
    text: &str,
) -> Result<()> {
    let ledger = Ledger::open(config).await?;
    let outcome = ledger
        .ingest_raw_document(&Caller::Service, source, url, title, text)
        .await?;
    match outcome {
        IngestOutcome::Created { id } => println!("created {}", id),
        IngestOutcome::Duplicate { existing_id } => println!("duplicate of {}", existing_id),
        IngestOutcome::Conflict { existing_id } => {
            println!("conflict: url already stored as {}", existing_id)
        }
    }
    ledger.close().await;
    Ok(())
}

pub async fn run_process(
    config: &Config,
    raw_id: &str,
    cleaned_text: &str,
    quality_score: Option<f64>,
    tokens: Vec<u32>,
) -> Result<()> {
    let ledger = Ledger::open(config).await?;
    let metrics = ProcessingMetrics {
        tokens,
        quality_score,
        ..Default::default()
    };
    let recorded = ledger
        .record_processed_document(&Caller::Service, raw_id, cleaned_text, metrics)
        .await?;
    println!(
        "recorded {} (quality {:.3}, ready: {})",
        recorded.document.id, recorded.document.quality_score, recorded.document.training_ready
    );
    if let Some(outcome) = &recorded.auto_train {
        print_auto_train(outcome);
    }
    ledger.close().await;
    Ok(())
}

pub async fn run_ready(config: &Config, processed_id: &str) -> Result<()> {
    let ledger = Ledger::open(config).await?;
    let outcome = ledger.mark_ready(&Caller::Service, processed_id).await?;
    println!("marked {} ready", processed_id);
    if let Some(outcome) = &outcome {
        print_auto_train(outcome);
    }
    ledger.close().await;
    Ok(())
}

fn print_auto_train(outcome: &AutoTrainOutcome) {
    match outcome {
        AutoTrainOutcome::Triggered { job_id } => println!("auto-train: triggered job {}", job_id),
        AutoTrainOutcome::AlreadyActive => println!("auto-train: job already active"),
        AutoTrainOutcome::BelowThreshold { ready, threshold } => {
            println!("auto-train: {} / {} ready", ready, threshold)
        }
        AutoTrainOutcome::CoolingDown => println!("auto-train: cooling down"),
        AutoTrainOutcome::Disabled => println!("auto-train: disabled"),
    }
}

pub async fn run_job_trigger(
    config: &Config,
    name: &str,
    model: &str,
    source: Option<String>,
    job_config: Option<&str>,
) -> Result<()> {
    let job_config = match job_config {
        Some(raw) => serde_json::from_str(raw).context("--config-json is not valid JSON")?,
        None => serde_json::json!({}),
    };
    let ledger = Ledger::open(config).await?;
    let job = ledger
        .trigger_training_job(
            &Caller::Service,
            JobRequest {
                name: name.to_string(),
                model_name: model.to_string(),
                source_filter: source,
                config: job_config,
            },
        )
        .await?;
    println!("job {} {} (model {})", job.id, job.status, job.model_name);
    ledger.close().await;
    Ok(())
}

pub async fn run_job_advance(
    config: &Config,
    job_id: &str,
    status: &str,
    model_path: Option<String>,
    error_message: Option<String>,
) -> Result<()> {
    let to: JobStatus = status.parse()?;
    let ledger = Ledger::open(config).await?;
    let job = ledger
        .advance_training_job(
            &Caller::Service,
            job_id,
            to,
            AdvancePayload {
                model_path,
                error_message,
            },
        )
        .await?;
    println!("job {} -> {}", job.id, job.status);
    ledger.close().await;
    Ok(())
}

pub async fn run_job_show(config: &Config, job_id: &str) -> Result<()> {
    let ledger = Ledger::open(config).await?;
    let job = ledger.get_training_job(&Caller::Service, job_id).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    ledger.close().await;
    Ok(())
}

pub async fn run_job_list(config: &Config, model: Option<&str>, limit: i64) -> Result<()> {
    let ledger = Ledger::open(config).await?;
    let jobs = ledger
        .list_training_jobs(&Caller::Service, model, limit)
        .await?;

    if jobs.is_empty() {
        println!("No training jobs.");
    } else {
        println!("  {:<36} {:<16} {:<10} {}", "ID", "MODEL", "STATUS", "NAME");
        println!("  {}", "-".repeat(80));
        for job in &jobs {
            println!(
                "  {:<36} {:<16} {:<10} {}",
                job.id, job.model_name, job.status, job.name
            );
        }
    }
    ledger.close().await;
    Ok(())
}

pub async fn run_usage_record(config: &Config, record: UsageRecord) -> Result<()> {
    let ledger = Ledger::open(config).await?;
    ledger.record_api_usage(&Caller::Service, &record).await?;
    println!("recorded usage for {}", record.user_id);
    ledger.close().await;
    Ok(())
}

pub async fn run_quota(config: &Config, user_id: &str) -> Result<()> {
    let ledger = Ledger::open(config).await?;
    let quota = ledger.get_user_quota(&Caller::Service, user_id).await?;
    let limits = ledger.quota_limits().limits_for(quota.tier);

    println!("User:           {}", quota.user_id);
    println!("Tier:           {}", quota.tier);
    println!("Subscription:   {}", quota.subscription_status);
    println!(
        "Requests today: {} / {}",
        quota.requests_today, limits.requests_per_day
    );
    println!(
        "Tokens today:   {} / {}",
        quota.tokens_today, limits.tokens_per_day
    );
    let verdict = match quota.evaluate(&limits) {
        QuotaDecision::Within { .. } => "within limits",
        QuotaDecision::RequestsExceeded => "request limit reached",
        QuotaDecision::TokensExceeded => "token limit reached",
    };
    println!("Status:         {}", verdict);
    ledger.close().await;
    Ok(())
}

pub async fn run_cleanup(config: &Config) -> Result<()> {
    let ledger = Ledger::open(config).await?;
    let report = ledger.run_retention_cleanup(&Caller::Service).await?;
    println!("Usage rows deleted:   {}", report.usage_rows_deleted);
    println!("Failed jobs deleted:  {}", report.jobs_deleted);
    println!("Raw docs deleted:     {}", report.content_rows_deleted);
    ledger.close().await;
    Ok(())
}

pub async fn run_provision(config: &Config, user_id: &str, email: &str) -> Result<()> {
    let ledger = Ledger::open(config).await?;
    match ledger
        .provision_profile(&Caller::Service, user_id, email)
        .await?
    {
        ProvisionOutcome::Created => println!("profile {} created", user_id),
        ProvisionOutcome::AlreadyExists => println!("profile {} already exists", user_id),
    }
    ledger.close().await;
    Ok(())
}
