//! Reactive handlers for external account lifecycle events.
//!
//! The auth provider announces account creation and deletion; handlers
//! registered in an [`EventRegistry`] react to each event in registration
//! order. Handlers must tolerate redelivery: the provider retries on any
//! non-success response.
//!
//! ```text
//! auth provider ──▶ POST /accounts/events ──▶ EventRegistry::dispatch
//!                                                ├─▶ ProfileProvisioner
//!                                                └─▶ AccountJanitor
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::auth::Caller;
use crate::error::Result;
use crate::profiles::{ProfileStore, ProvisionOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AccountEvent {
    UserCreated { user_id: String, email: String },
    UserDeleted { user_id: String },
}

/// What a single handler did with an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerReport {
    pub handler: String,
    pub outcome: String,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Handle the event, or return `Ok(None)` if it is not of interest.
    async fn handle(&self, event: &AccountEvent) -> Result<Option<String>>;
}

/// Ordered collection of event handlers.
#[derive(Default)]
pub struct EventRegistry {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in profile handlers.
    pub fn with_builtins(profiles: ProfileStore) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ProfileProvisioner::new(profiles.clone())));
        registry.register(Box::new(AccountJanitor::new(profiles)));
        registry
    }

    pub fn register(&mut self, handler: Box<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Run every interested handler. Stops at the first failure so the
    /// provider redelivers the event.
    pub async fn dispatch(&self, event: &AccountEvent) -> Result<Vec<HandlerReport>> {
        let mut reports = Vec::new();
        for handler in &self.handlers {
            if let Some(outcome) = handler.handle(event).await? {
                reports.push(HandlerReport {
                    handler: handler.name().to_string(),
                    outcome,
                });
            }
        }
        Ok(reports)
    }
}

/// Creates a free/inactive profile when an account is created.
pub struct ProfileProvisioner {
    profiles: ProfileStore,
}

impl ProfileProvisioner {
    pub fn new(profiles: ProfileStore) -> Self {
        Self { profiles }
    }
}

#[async_trait]
impl EventHandler for ProfileProvisioner {
    fn name(&self) -> &str {
        "profile_provisioner"
    }

    async fn handle(&self, event: &AccountEvent) -> Result<Option<String>> {
        let AccountEvent::UserCreated { user_id, email } = event else {
            return Ok(None);
        };
        let outcome = match self
            .profiles
            .provision(&Caller::Service, user_id, email)
            .await?
        {
            ProvisionOutcome::Created => "created",
            ProvisionOutcome::AlreadyExists => "already_exists",
        };
        Ok(Some(outcome.to_string()))
    }
}

/// Removes the profile, chat history and usage of a deleted account.
pub struct AccountJanitor {
    profiles: ProfileStore,
}

impl AccountJanitor {
    pub fn new(profiles: ProfileStore) -> Self {
        Self { profiles }
    }
}

#[async_trait]
impl EventHandler for AccountJanitor {
    fn name(&self) -> &str {
        "account_janitor"
    }

    async fn handle(&self, event: &AccountEvent) -> Result<Option<String>> {
        let AccountEvent::UserDeleted { user_id } = event else {
            return Ok(None);
        };
        let removed = self
            .profiles
            .delete_account(&Caller::Service, user_id)
            .await?;
        Ok(Some(if removed > 0 { "deleted" } else { "absent" }.to_string()))
    }
}
