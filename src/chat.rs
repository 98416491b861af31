//! Append-only chat history, scoped to the owning user.

use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::Caller;
use crate::clock::Clock;
use crate::error::{LedgerError, Result};
use crate::models::{ChatMessage, ChatSession};

/// One exchange to append to a session.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewMessage {
    pub user_message: String,
    pub bot_response: String,
    #[serde(default)]
    pub tokens: i64,
    #[serde(default)]
    pub latency_ms: i64,
    #[serde(default)]
    pub model_version: Option<String>,
}

#[derive(Clone)]
pub struct ChatHistory {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl ChatHistory {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub async fn create_session(
        &self,
        caller: &Caller,
        user_id: &str,
        model_version: Option<&str>,
    ) -> Result<ChatSession> {
        caller.require_owner(user_id)?;
        let session = ChatSession {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            model_version: model_version.map(str::to_string),
            created_at: self.clock.now_millis(),
        };
        sqlx::query(
            "INSERT INTO chat_sessions (id, user_id, model_version, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.model_version)
        .bind(session.created_at)
        .execute(&self.pool)
        .await?;
        Ok(session)
    }

    pub async fn append_message(
        &self,
        caller: &Caller,
        session_id: &str,
        message: NewMessage,
    ) -> Result<ChatMessage> {
        let owner = self.session_owner(session_id).await?;
        caller.require_owner(&owner)?;

        let msg = ChatMessage {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            user_id: owner,
            user_message: message.user_message,
            bot_response: message.bot_response,
            tokens: message.tokens.max(0),
            latency_ms: message.latency_ms.max(0),
            model_version: message.model_version,
            created_at: self.clock.now_millis(),
        };
        sqlx::query(
            r#"
            INSERT INTO chat_messages (id, session_id, user_id, user_message, bot_response,
                                       tokens_used, latency_ms, model_version, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&msg.id)
        .bind(&msg.session_id)
        .bind(&msg.user_id)
        .bind(&msg.user_message)
        .bind(&msg.bot_response)
        .bind(msg.tokens)
        .bind(msg.latency_ms)
        .bind(&msg.model_version)
        .bind(msg.created_at)
        .execute(&self.pool)
        .await?;
        Ok(msg)
    }

    /// Newest first.
    pub async fn list_messages(
        &self,
        caller: &Caller,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<ChatMessage>> {
        let owner = self.session_owner(session_id).await?;
        caller.require_owner(&owner)?;

        let rows = sqlx::query(
            r#"
            SELECT id, session_id, user_id, user_message, bot_response, tokens_used,
                   latency_ms, model_version, created_at
            FROM chat_messages
            WHERE session_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(session_id)
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ChatMessage {
                id: row.get("id"),
                session_id: row.get("session_id"),
                user_id: row.get("user_id"),
                user_message: row.get("user_message"),
                bot_response: row.get("bot_response"),
                tokens: row.get("tokens_used"),
                latency_ms: row.get("latency_ms"),
                model_version: row.get("model_version"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn session_owner(&self, session_id: &str) -> Result<String> {
        sqlx::query_scalar("SELECT user_id FROM chat_sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("chat session {}", session_id)))
    }
}
