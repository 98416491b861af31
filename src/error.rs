//! Error kinds surfaced by ledger operations.
//!
//! Duplicate ingests, already-provisioned profiles and skipped auto-triggers
//! are ordinary outcomes and are returned as enum results, not errors.

use thiserror::Error;

/// Result alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Error, Debug)]
pub enum LedgerError {
    /// Reference to a row that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate content, URL re-scraped with different content, or an
    /// active training job already present for a model.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Out-of-order or terminal-to-nonterminal job state change.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Caller identity is not allowed to touch the row.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Request payload failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Storage could not be reached.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl LedgerError {
    /// Machine-readable code used by the HTTP error contract.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::NotFound(_) => "not_found",
            LedgerError::Conflict(_) => "conflict",
            LedgerError::InvalidTransition(_) => "invalid_transition",
            LedgerError::Forbidden(_) => "forbidden",
            LedgerError::InvalidInput(_) => "bad_request",
            LedgerError::Unavailable(_) => "unavailable",
            LedgerError::Database(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_) => LedgerError::Unavailable(err.to_string()),
            other => LedgerError::Database(other),
        }
    }
}

/// True when the error is a violated UNIQUE or PRIMARY KEY constraint.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}
