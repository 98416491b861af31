//! # Quota Ledger CLI (`qledger`)
//!
//! The `qledger` binary is the operator interface for the ledger. It
//! provides commands for database initialization, content ingestion,
//! training job management, usage accounting, retention, and starting the
//! HTTP server. Every command runs as the trusted service identity.
//!
//! ## Usage
//!
//! ```bash
//! qledger --config ./config/ledger.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `qledger init` | Create the SQLite database and apply the schema |
//! | `qledger ingest` | Store a raw scraped document (deduplicated) |
//! | `qledger process <raw-id>` | Record a processed document |
//! | `qledger ready <id>` | Mark a processed document training-ready |
//! | `qledger stats` | Corpus and usage statistics |
//! | `qledger job trigger\|advance\|show\|list` | Training job lifecycle |
//! | `qledger usage record` | Append an API usage row |
//! | `qledger quota <user>` | A user's usage today against their tier |
//! | `qledger cleanup` | Run one retention pass |
//! | `qledger provision <user> <email>` | Create a default profile |
//! | `qledger serve` | Start the HTTP server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use quota_ledger::models::UsageRecord;
use quota_ledger::{commands, config, migrate, server, stats};

/// Quota Ledger CLI: usage quotas, content dedup and training jobs for a
/// tiered chat product.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ledger.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "qledger",
    about = "Quota Ledger: usage quotas, content dedup and training-job lifecycle",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ledger.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Store a raw scraped document.
    ///
    /// Identical text is reported as a duplicate and not stored again; a
    /// known URL with different text is reported as a conflict.
    Ingest {
        #[arg(long)]
        source: String,
        #[arg(long)]
        url: String,
        #[arg(long)]
        title: Option<String>,
        /// Document text.
        #[arg(long)]
        text: Option<String>,
        /// Read the document text from a file instead.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Record the processed form of a raw document.
    ///
    /// Without `--quality-score`, metrics are computed from the text.
    Process {
        /// Raw document id.
        raw_id: String,
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        quality_score: Option<f64>,
        /// Token ids, comma separated.
        #[arg(long, value_delimiter = ',')]
        tokens: Vec<u32>,
    },

    /// Mark a processed document training-ready.
    Ready {
        /// Processed document id.
        id: String,
    },

    /// Show corpus, training and usage statistics.
    Stats,

    /// Manage training jobs.
    Job {
        #[command(subcommand)]
        action: JobAction,
    },

    /// Record API usage.
    Usage {
        #[command(subcommand)]
        action: UsageAction,
    },

    /// Show a user's quota for today.
    Quota {
        user_id: String,
    },

    /// Run one retention cleanup pass.
    Cleanup,

    /// Provision a default profile for a user (idempotent).
    Provision {
        user_id: String,
        email: String,
    },

    /// Start the HTTP server.
    ///
    /// Binds to `[server].bind` and runs retention on
    /// `[retention].interval_hours`.
    Serve,
}

#[derive(Subcommand)]
enum JobAction {
    /// Create a pending job. Fails if the model already has an active job.
    Trigger {
        #[arg(long)]
        name: String,
        #[arg(long)]
        model: String,
        /// Restrict the job to one content source.
        #[arg(long)]
        source: Option<String>,
        /// Opaque job configuration as JSON.
        #[arg(long)]
        config_json: Option<String>,
    },
    /// Move a job to a new status.
    Advance {
        id: String,
        /// started, training, completed or failed.
        status: String,
        #[arg(long)]
        model_path: Option<String>,
        #[arg(long)]
        error: Option<String>,
    },
    /// Print a job as JSON.
    Show { id: String },
    /// List jobs, newest first.
    List {
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum UsageAction {
    /// Append one usage row.
    Record {
        #[arg(long)]
        user: String,
        #[arg(long)]
        endpoint: String,
        #[arg(long, default_value_t = 0)]
        tokens: i64,
        #[arg(long, default_value_t = 0)]
        latency_ms: i64,
        #[arg(long, default_value_t = 200)]
        status_code: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quota_ledger=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            source,
            url,
            title,
            text,
            file,
        } => {
            let text = commands::read_text(text, file.as_deref())?;
            commands::run_ingest(&cfg, &source, &url, title.as_deref(), &text).await?;
        }
        Commands::Process {
            raw_id,
            text,
            file,
            quality_score,
            tokens,
        } => {
            let text = commands::read_text(text, file.as_deref())?;
            commands::run_process(&cfg, &raw_id, &text, quality_score, tokens).await?;
        }
        Commands::Ready { id } => {
            commands::run_ready(&cfg, &id).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Job { action } => match action {
            JobAction::Trigger {
                name,
                model,
                source,
                config_json,
            } => {
                commands::run_job_trigger(&cfg, &name, &model, source, config_json.as_deref())
                    .await?;
            }
            JobAction::Advance {
                id,
                status,
                model_path,
                error,
            } => {
                commands::run_job_advance(&cfg, &id, &status, model_path, error).await?;
            }
            JobAction::Show { id } => {
                commands::run_job_show(&cfg, &id).await?;
            }
            JobAction::List { model, limit } => {
                commands::run_job_list(&cfg, model.as_deref(), limit).await?;
            }
        },
        Commands::Usage { action } => match action {
            UsageAction::Record {
                user,
                endpoint,
                tokens,
                latency_ms,
                status_code,
            } => {
                commands::run_usage_record(
                    &cfg,
                    UsageRecord {
                        user_id: user,
                        endpoint,
                        tokens,
                        latency_ms,
                        status_code,
                    },
                )
                .await?;
            }
        },
        Commands::Quota { user_id } => {
            commands::run_quota(&cfg, &user_id).await?;
        }
        Commands::Cleanup => {
            commands::run_cleanup(&cfg).await?;
        }
        Commands::Provision { user_id, email } => {
            commands::run_provision(&cfg, &user_id, &email).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
