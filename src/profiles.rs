//! User profiles: provisioning on signup, reads, and billing-driven tier
//! changes.

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::info;

use crate::auth::Caller;
use crate::clock::Clock;
use crate::error::{LedgerError, Result};
use crate::models::{SubscriptionStatus, Tier, UserProfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionOutcome {
    Created,
    AlreadyExists,
}

#[derive(Clone)]
pub struct ProfileStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl ProfileStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Create a free/inactive profile for a new account.
    ///
    /// Duplicate signals for the same user are absorbed by the primary key.
    pub async fn provision(
        &self,
        caller: &Caller,
        user_id: &str,
        email: &str,
    ) -> Result<ProvisionOutcome> {
        caller.require_service("profile provisioning")?;
        if user_id.trim().is_empty() {
            return Err(LedgerError::InvalidInput("user_id must not be empty".into()));
        }

        let now = self.clock.now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO user_profiles (user_id, email, tier, subscription_status, created_at, updated_at)
            VALUES (?, ?, 'free', 'inactive', ?, ?)
            ON CONFLICT(user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(email)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            info!(user_id, "profile provisioned");
            Ok(ProvisionOutcome::Created)
        } else {
            Ok(ProvisionOutcome::AlreadyExists)
        }
    }

    pub async fn get(&self, caller: &Caller, user_id: &str) -> Result<UserProfile> {
        caller.require_owner(user_id)?;
        self.find(user_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("profile {}", user_id)))
    }

    pub(crate) async fn find(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let row = sqlx::query(
            "SELECT user_id, email, tier, subscription_status, billing_customer_id, created_at, updated_at FROM user_profiles WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(profile_from_row).transpose()
    }

    /// The one field a user may change on their own profile.
    pub async fn update_email(&self, caller: &Caller, user_id: &str, email: &str) -> Result<()> {
        caller.require_owner(user_id)?;
        if !email.contains('@') {
            return Err(LedgerError::InvalidInput(format!("invalid email: {}", email)));
        }
        let result =
            sqlx::query("UPDATE user_profiles SET email = ?, updated_at = ? WHERE user_id = ?")
                .bind(email)
                .bind(self.clock.now_millis())
                .bind(user_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("profile {}", user_id)));
        }
        Ok(())
    }

    pub async fn link_billing_customer(
        &self,
        caller: &Caller,
        user_id: &str,
        customer_id: &str,
    ) -> Result<()> {
        caller.require_service("billing linkage")?;
        let result = sqlx::query(
            "UPDATE user_profiles SET billing_customer_id = ?, updated_at = ? WHERE user_id = ?",
        )
        .bind(customer_id)
        .bind(self.clock.now_millis())
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("profile {}", user_id)));
        }
        Ok(())
    }

    /// Set tier and/or status on every profile linked to a billing customer.
    /// Returns how many profiles changed; zero is not an error.
    pub async fn apply_subscription(
        &self,
        caller: &Caller,
        customer_id: &str,
        tier: Option<Tier>,
        status: SubscriptionStatus,
    ) -> Result<u64> {
        caller.require_service("subscription updates")?;
        let result = sqlx::query(
            r#"
            UPDATE user_profiles
            SET tier = COALESCE(?, tier), subscription_status = ?, updated_at = ?
            WHERE billing_customer_id = ?
            "#,
        )
        .bind(tier.map(|t| t.as_str()))
        .bind(status.as_str())
        .bind(self.clock.now_millis())
        .bind(customer_id)
        .execute(&self.pool)
        .await?;

        info!(
            customer_id,
            tier = tier.map(|t| t.as_str()).unwrap_or("unchanged"),
            status = status.as_str(),
            updated = result.rows_affected(),
            "subscription applied"
        );
        Ok(result.rows_affected())
    }

    /// Remove everything owned by a deleted account.
    pub async fn delete_account(&self, caller: &Caller, user_id: &str) -> Result<u64> {
        caller.require_service("account deletion")?;
        let mut tx = self.pool.begin().await?;

        // Messages cascade from their sessions.
        sqlx::query("DELETE FROM chat_sessions WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM api_usage WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM user_profiles WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        info!(user_id, "account data removed");
        Ok(removed)
    }
}

fn profile_from_row(row: &SqliteRow) -> Result<UserProfile> {
    let tier: String = row.get("tier");
    let status: String = row.get("subscription_status");
    Ok(UserProfile {
        user_id: row.get("user_id"),
        email: row.get("email"),
        tier: tier.parse()?,
        subscription_status: status.parse()?,
        billing_customer_id: row.get("billing_customer_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
