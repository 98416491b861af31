use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::Tier;

/// Upper bounds keep every window representable as a millisecond offset.
const MAX_RETENTION_DAYS: i64 = 36_500;
const MAX_COOLDOWN_HOURS: i64 = 8_760;
const MAX_INTERVAL_HOURS: u64 = 8_760;
const MAX_TOLERANCE_SECS: i64 = 86_400;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub auto_train: AutoTrainConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub billing: BillingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessingConfig {
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    #[serde(default)]
    pub min_tokens: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            quality_threshold: default_quality_threshold(),
            min_tokens: 0,
        }
    }
}

fn default_quality_threshold() -> f64 {
    0.6
}

#[derive(Debug, Deserialize, Clone)]
pub struct AutoTrainConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_auto_train_threshold")]
    pub threshold: i64,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: i64,
}

impl Default for AutoTrainConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_auto_train_threshold(),
            model_name: default_model_name(),
            cooldown_hours: default_cooldown_hours(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_auto_train_threshold() -> i64 {
    1000
}
fn default_model_name() -> String {
    "chat-base".to_string()
}
fn default_cooldown_hours() -> i64 {
    24
}

/// Per-tier ceilings. Enforced by the serving layer, never by the ledger.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub requests_per_day: i64,
    pub tokens_per_day: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QuotaConfig {
    #[serde(default = "default_free_limits")]
    pub free: QuotaLimits,
    #[serde(default = "default_pro_limits")]
    pub pro: QuotaLimits,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free: default_free_limits(),
            pro: default_pro_limits(),
        }
    }
}

impl QuotaConfig {
    pub fn limits_for(&self, tier: Tier) -> QuotaLimits {
        match tier {
            Tier::Free => self.free,
            Tier::Pro => self.pro,
        }
    }
}

fn default_free_limits() -> QuotaLimits {
    QuotaLimits {
        requests_per_day: 100,
        tokens_per_day: 50_000,
    }
}
fn default_pro_limits() -> QuotaLimits {
    QuotaLimits {
        requests_per_day: 10_000,
        tokens_per_day: 1_000_000,
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    #[serde(default = "default_usage_days")]
    pub usage_days: i64,
    #[serde(default = "default_failed_job_days")]
    pub failed_job_days: i64,
    #[serde(default = "default_max_documents_per_source")]
    pub max_documents_per_source: i64,
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            usage_days: default_usage_days(),
            failed_job_days: default_failed_job_days(),
            max_documents_per_source: default_max_documents_per_source(),
            interval_hours: default_interval_hours(),
        }
    }
}

fn default_usage_days() -> i64 {
    30
}
fn default_failed_job_days() -> i64 {
    7
}
fn default_max_documents_per_source() -> i64 {
    10_000
}
fn default_interval_hours() -> u64 {
    24
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token identifying the trusted service caller.
    #[serde(default)]
    pub service_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            service_token: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7440".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BillingConfig {
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_tolerance_secs")]
    pub tolerance_secs: i64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            webhook_secret: None,
            tolerance_secs: default_tolerance_secs(),
        }
    }
}

fn default_tolerance_secs() -> i64 {
    300
}

impl Config {
    /// Config with every section at its default, rooted at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            processing: ProcessingConfig::default(),
            auto_train: AutoTrainConfig::default(),
            quota: QuotaConfig::default(),
            retention: RetentionConfig::default(),
            server: ServerConfig::default(),
            billing: BillingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.processing.quality_threshold) {
            anyhow::bail!("processing.quality_threshold must be in [0.0, 1.0]");
        }

        if self.auto_train.threshold < 1 {
            anyhow::bail!("auto_train.threshold must be >= 1");
        }
        if self.auto_train.model_name.trim().is_empty() {
            anyhow::bail!("auto_train.model_name must not be empty");
        }
        if !(0..=MAX_COOLDOWN_HOURS).contains(&self.auto_train.cooldown_hours) {
            anyhow::bail!(
                "auto_train.cooldown_hours must be in [0, {}]",
                MAX_COOLDOWN_HOURS
            );
        }

        for (tier, limits) in [("free", &self.quota.free), ("pro", &self.quota.pro)] {
            if limits.requests_per_day < 0 || limits.tokens_per_day < 0 {
                anyhow::bail!("quota.{} limits must be >= 0", tier);
            }
        }

        if !(1..=MAX_RETENTION_DAYS).contains(&self.retention.usage_days) {
            anyhow::bail!("retention.usage_days must be in [1, {}]", MAX_RETENTION_DAYS);
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&self.retention.failed_job_days) {
            anyhow::bail!(
                "retention.failed_job_days must be in [1, {}]",
                MAX_RETENTION_DAYS
            );
        }
        if self.retention.max_documents_per_source < 1 {
            anyhow::bail!("retention.max_documents_per_source must be >= 1");
        }
        if !(1..=MAX_INTERVAL_HOURS).contains(&self.retention.interval_hours) {
            anyhow::bail!(
                "retention.interval_hours must be in [1, {}]",
                MAX_INTERVAL_HOURS
            );
        }

        if !(0..=MAX_TOLERANCE_SECS).contains(&self.billing.tolerance_secs) {
            anyhow::bail!(
                "billing.tolerance_secs must be in [0, {}]",
                MAX_TOLERANCE_SECS
            );
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
