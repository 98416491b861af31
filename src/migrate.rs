use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_profiles (
            user_id TEXT PRIMARY KEY,
            email TEXT NOT NULL,
            tier TEXT NOT NULL DEFAULT 'free' CHECK (tier IN ('free', 'pro')),
            subscription_status TEXT NOT NULL DEFAULT 'inactive'
                CHECK (subscription_status IN ('active', 'inactive', 'cancelled', 'past_due')),
            billing_customer_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_documents (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            url TEXT NOT NULL UNIQUE,
            title TEXT,
            text TEXT NOT NULL,
            content_hash TEXT NOT NULL UNIQUE,
            scraped_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processed_documents (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            raw_id TEXT NOT NULL UNIQUE,
            cleaned_text TEXT NOT NULL,
            tokens_json TEXT NOT NULL DEFAULT '[]',
            word_count INTEGER NOT NULL,
            sentence_count INTEGER NOT NULL,
            quality_score REAL NOT NULL CHECK (quality_score >= 0.0 AND quality_score <= 1.0),
            readability_score REAL NOT NULL,
            vocabulary_diversity REAL NOT NULL,
            training_ready INTEGER NOT NULL DEFAULT 0,
            processed_at INTEGER NOT NULL,
            FOREIGN KEY (raw_id) REFERENCES raw_documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS training_jobs (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            model_name TEXT NOT NULL,
            source_filter TEXT,
            config_json TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'started', 'training', 'completed', 'failed')),
            model_path TEXT,
            error_message TEXT,
            requested_by TEXT,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            failed_at INTEGER,
            CHECK (status != 'completed' OR (model_path IS NOT NULL AND error_message IS NULL)),
            CHECK (status != 'failed' OR (error_message IS NOT NULL AND model_path IS NULL))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS api_usage (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            tokens_used INTEGER NOT NULL DEFAULT 0,
            latency_ms INTEGER NOT NULL DEFAULT 0,
            status_code INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_sessions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            model_version TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_messages (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            user_message TEXT NOT NULL,
            bot_response TEXT NOT NULL,
            tokens_used INTEGER NOT NULL DEFAULT 0,
            latency_ms INTEGER NOT NULL DEFAULT 0,
            model_version TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (session_id) REFERENCES chat_sessions(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one non-terminal job per model. Concurrent triggers race on
    // this index, not on an application-level check.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_training_jobs_active_model
        ON training_jobs(model_name)
        WHERE status IN ('pending', 'started', 'training')
        "#,
    )
    .execute(pool)
    .await?;

    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_raw_documents_source_scraped ON raw_documents(source, scraped_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_processed_documents_source_ready ON processed_documents(source, training_ready)",
        "CREATE INDEX IF NOT EXISTS idx_training_jobs_model_created ON training_jobs(model_name, created_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_training_jobs_status ON training_jobs(status)",
        "CREATE INDEX IF NOT EXISTS idx_api_usage_user_created ON api_usage(user_id, created_at)",
        "CREATE INDEX IF NOT EXISTS idx_api_usage_created ON api_usage(created_at)",
        "CREATE INDEX IF NOT EXISTS idx_user_profiles_customer ON user_profiles(billing_customer_id)",
        "CREATE INDEX IF NOT EXISTS idx_chat_sessions_user ON chat_sessions(user_id)",
        "CREATE INDEX IF NOT EXISTS idx_chat_messages_session_created ON chat_messages(session_id, created_at DESC)",
    ];
    for ddl in indexes {
        sqlx::query(ddl).execute(pool).await?;
    }

    Ok(())
}
