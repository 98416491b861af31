//! # Quota Ledger
//!
//! Usage-quota accounting, content deduplication and training-job lifecycle
//! for a tiered (free/pro) chat product.
//!
//! The ledger sits between the scraping, processing, training and serving
//! layers. It stores what they produce, enforces the invariants between
//! them, and reports per-user daily usage so the serving layer can throttle.
//!
//! ## Architecture
//!
//! ```text
//! scraper ──▶ ContentStore ──▶ processor ──▶ ProcessingLedger
//!             (dedup)                         (quality, readiness)
//!                                                    │ ready count
//!                                                    ▼
//!                                  TrainingJobRegistry ◀── training worker
//!                                  (one active job per model)
//!
//! serving layer ──▶ UsageMeter ──▶ QuotaService ──▶ serving layer
//!
//! auth provider ──▶ EventRegistry ──▶ ProfileStore ◀── billing webhooks
//!
//! RetentionJanitor bounds usage, failed jobs and raw content per source.
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! qledger init
//! qledger ingest --source tech_news --url https://example.com/a --text "Hello World"
//! qledger job trigger --name job-A --model m1
//! qledger quota U1
//! qledger serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and the job state machine |
//! | [`error`] | `LedgerError` and the crate `Result` |
//! | [`auth`] | Caller identity and row ownership checks |
//! | [`clock`] | Injectable time source |
//! | [`content`] | Raw document store with fingerprint dedup |
//! | [`quality`] | Text metrics and quality scoring |
//! | [`processing`] | Processed document ledger |
//! | [`training`] | Training job registry and auto-train policy |
//! | [`usage`] | Append-only API usage log |
//! | [`quota`] | Per-user daily quota reporting |
//! | [`profiles`] | User profiles |
//! | [`billing`] | Billing webhook verification |
//! | [`events`] | Account lifecycle event handlers |
//! | [`chat`] | Chat session history |
//! | [`retention`] | Bounded-retention cleanup |
//! | [`stats`] | Training corpus statistics |
//! | [`ledger`] | Facade wiring every component together |
//! | [`commands`] | CLI command implementations |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod auth;
pub mod billing;
pub mod chat;
pub mod clock;
pub mod commands;
pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod events;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod processing;
pub mod profiles;
pub mod quality;
pub mod quota;
pub mod retention;
pub mod server;
pub mod stats;
pub mod training;
pub mod usage;

pub use error::{LedgerError, Result};
pub use ledger::Ledger;
