//! Per-user daily quota reporting.
//!
//! Reports usage since midnight UTC together with the user's tier. It never
//! rejects a request; the serving layer compares the figures against the
//! configured ceilings, optionally through [`Quota::evaluate`].

use serde::Serialize;
use std::sync::Arc;

use crate::auth::Caller;
use crate::clock::Clock;
use crate::config::QuotaLimits;
use crate::error::Result;
use crate::models::{SubscriptionStatus, Tier};
use crate::profiles::ProfileStore;
use crate::usage::UsageMeter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quota {
    pub user_id: String,
    pub tier: Tier,
    pub subscription_status: SubscriptionStatus,
    pub requests_today: i64,
    pub tokens_today: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum QuotaDecision {
    Within {
        requests_remaining: i64,
        tokens_remaining: i64,
    },
    RequestsExceeded,
    TokensExceeded,
}

impl Quota {
    pub fn evaluate(&self, limits: &QuotaLimits) -> QuotaDecision {
        if self.requests_today >= limits.requests_per_day {
            QuotaDecision::RequestsExceeded
        } else if self.tokens_today >= limits.tokens_per_day {
            QuotaDecision::TokensExceeded
        } else {
            QuotaDecision::Within {
                requests_remaining: limits.requests_per_day - self.requests_today,
                tokens_remaining: limits.tokens_per_day - self.tokens_today,
            }
        }
    }
}

#[derive(Clone)]
pub struct QuotaService {
    profiles: ProfileStore,
    usage: UsageMeter,
    clock: Arc<dyn Clock>,
}

impl QuotaService {
    pub fn new(profiles: ProfileStore, usage: UsageMeter, clock: Arc<dyn Clock>) -> Self {
        Self {
            profiles,
            usage,
            clock,
        }
    }

    /// Today's usage for `user_id`. A user without a profile or without
    /// usage rows gets the free/inactive defaults and zero counts.
    pub async fn get_quota(&self, caller: &Caller, user_id: &str) -> Result<Quota> {
        caller.require_owner(user_id)?;

        let (tier, subscription_status) = match self.profiles.find(user_id).await? {
            Some(p) => (p.tier, p.subscription_status),
            None => (Tier::Free, SubscriptionStatus::Inactive),
        };
        let totals = self
            .usage
            .totals_since(user_id, self.clock.start_of_day_millis())
            .await?;

        Ok(Quota {
            user_id: user_id.to_string(),
            tier,
            subscription_status,
            requests_today: totals.requests,
            tokens_today: totals.tokens,
        })
    }
}
