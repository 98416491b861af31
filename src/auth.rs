//! Caller identity and per-row authorization.
//!
//! Every operation receives the verified identity of whoever is calling it.
//! Service-owned tables (content, processing, jobs) are closed to end users;
//! user-owned rows are visible only to their owner and the service.

use serde::Serialize;

use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "user_id", rename_all = "lowercase")]
pub enum Caller {
    /// Trusted backend identity (scraper, processor, trainer, gateway).
    Service,
    /// End user, identified by their account id.
    User(String),
}

impl Caller {
    pub fn user(id: impl Into<String>) -> Self {
        Caller::User(id.into())
    }

    pub fn require_service(&self, what: &str) -> Result<()> {
        match self {
            Caller::Service => Ok(()),
            Caller::User(id) => Err(LedgerError::Forbidden(format!(
                "{} is restricted to the service identity (caller: {})",
                what, id
            ))),
        }
    }

    /// Allow the service, or the user who owns the row.
    pub fn require_owner(&self, owner_id: &str) -> Result<()> {
        match self {
            Caller::Service => Ok(()),
            Caller::User(id) if id == owner_id => Ok(()),
            Caller::User(id) => Err(LedgerError::Forbidden(format!(
                "user {} may not access rows owned by {}",
                id, owner_id
            ))),
        }
    }
}
