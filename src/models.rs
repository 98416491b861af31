//! Core data models persisted by the ledger.
//!
//! Rows are stored with epoch-millisecond timestamps and UUID string
//! identifiers. The enums here are the only place that maps between the
//! stored text representation and the typed value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LedgerError;

/// Subscription class controlling quota ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
        }
    }
}

impl FromStr for Tier {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            other => Err(LedgerError::InvalidInput(format!("unknown tier: {}", other))),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
    Cancelled,
    PastDue,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::PastDue => "past_due",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "inactive" => Ok(SubscriptionStatus::Inactive),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            other => Err(LedgerError::InvalidInput(format!(
                "unknown subscription status: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Training job lifecycle state.
///
/// The declaration order is the lifecycle order; `Failed` sits outside it
/// and is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Started,
    Training,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Started => "started",
            JobStatus::Training => "training",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Position in the forward lifecycle; `None` for `Failed`.
    fn rank(&self) -> Option<u8> {
        match self {
            JobStatus::Pending => Some(0),
            JobStatus::Started => Some(1),
            JobStatus::Training => Some(2),
            JobStatus::Completed => Some(3),
            JobStatus::Failed => None,
        }
    }

    /// Whether a job may move from `self` to `next`.
    ///
    /// Forward moves may skip states; nothing leaves a terminal state and
    /// nothing re-enters the state it is already in.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(from), Some(to)) => to > from,
            (None, Some(_)) => false,
        }
    }
}

impl FromStr for JobStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "started" => Ok(JobStatus::Started),
            "training" => Ok(JobStatus::Training),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(LedgerError::InvalidInput(format!(
                "unknown job status: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub user_id: String,
    pub email: String,
    pub tier: Tier,
    pub subscription_status: SubscriptionStatus,
    pub billing_customer_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Scraped document as stored by the content store. Immutable.
#[derive(Debug, Clone, Serialize)]
pub struct RawDocument {
    pub id: String,
    pub source: String,
    pub url: String,
    pub title: Option<String>,
    pub text: String,
    pub content_hash: String,
    pub scraped_at: i64,
}

/// Metrics supplied by the external processing step.
///
/// Any score left as `None` is computed from the cleaned text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    #[serde(default)]
    pub tokens: Vec<u32>,
    #[serde(default)]
    pub word_count: Option<i64>,
    #[serde(default)]
    pub sentence_count: Option<i64>,
    #[serde(default)]
    pub quality_score: Option<f64>,
    #[serde(default)]
    pub readability_score: Option<f64>,
    #[serde(default)]
    pub vocabulary_diversity: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessedDocument {
    pub id: String,
    pub source: String,
    pub raw_id: String,
    pub cleaned_text: String,
    pub tokens: Vec<u32>,
    pub word_count: i64,
    pub sentence_count: i64,
    pub quality_score: f64,
    pub readability_score: f64,
    pub vocabulary_diversity: f64,
    pub training_ready: bool,
    pub processed_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingJob {
    pub id: String,
    pub name: String,
    pub model_name: String,
    pub source_filter: Option<String>,
    pub config: serde_json::Value,
    pub status: JobStatus,
    pub model_path: Option<String>,
    pub error_message: Option<String>,
    pub requested_by: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub failed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub endpoint: String,
    pub tokens: i64,
    pub latency_ms: i64,
    pub status_code: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub model_version: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub user_message: String,
    pub bot_response: String,
    pub tokens: i64,
    pub latency_ms: i64,
    pub model_version: Option<String>,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        assert!(JobStatus::Pending.can_advance_to(JobStatus::Started));
        assert!(JobStatus::Started.can_advance_to(JobStatus::Training));
        assert!(JobStatus::Training.can_advance_to(JobStatus::Completed));
        assert!(JobStatus::Pending.can_advance_to(JobStatus::Training));
    }

    #[test]
    fn test_failed_reachable_from_any_active_state() {
        for s in [JobStatus::Pending, JobStatus::Started, JobStatus::Training] {
            assert!(s.can_advance_to(JobStatus::Failed), "{} -> failed", s);
        }
    }

    #[test]
    fn test_no_backward_or_self_transitions() {
        assert!(!JobStatus::Started.can_advance_to(JobStatus::Pending));
        assert!(!JobStatus::Training.can_advance_to(JobStatus::Started));
        assert!(!JobStatus::Pending.can_advance_to(JobStatus::Pending));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for next in [
            JobStatus::Pending,
            JobStatus::Started,
            JobStatus::Training,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert!(!JobStatus::Completed.can_advance_to(next));
            assert!(!JobStatus::Failed.can_advance_to(next));
        }
    }

    #[test]
    fn test_status_text_roundtrip() {
        for s in ["pending", "started", "training", "completed", "failed"] {
            assert_eq!(s.parse::<JobStatus>().unwrap().as_str(), s);
        }
        assert!("queued".parse::<JobStatus>().is_err());
        assert_eq!("past_due".parse::<SubscriptionStatus>().unwrap(), SubscriptionStatus::PastDue);
    }
}
