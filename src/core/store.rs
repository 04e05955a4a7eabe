//! Durable conversation storage
//!
//! Conversations and their turns live in a local SQLite database. Turns are
//! append-only: the relay hands over a completed (or partial) turn exactly
//! once, and re-appending the same turn identity is a no-op so a retry can
//! never duplicate history. All writes go through one connection guarded by
//! an async mutex, which serializes appends.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::core::constants::PREVIEW_MAX_CHARS;
use crate::core::error::GatewayError;
use crate::core::message::Role;

pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub system_prompt: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub preview: Option<String>,
    pub message_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub turn_id: String,
    pub role: String,
    pub content: String,
    /// Provider and model actually used, denormalized so the record
    /// survives later provider deletion.
    pub provider: Option<String>,
    pub model: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationDetail {
    pub id: String,
    pub title: String,
    pub system_prompt: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub messages: Vec<StoredMessage>,
}

#[derive(Debug, Clone)]
pub struct TurnMessage {
    pub role: Role,
    pub content: String,
    pub provider: Option<String>,
    pub model: Option<String>,
}

/// One exchange, identified for idempotent persistence.
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: String,
    pub messages: Vec<TurnMessage>,
}

impl Turn {
    pub fn new(messages: Vec<TurnMessage>) -> Self {
        Turn {
            id: new_id(),
            messages,
        }
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(
        &self,
        title: Option<String>,
        system_prompt: Option<String>,
    ) -> Result<ConversationSummary, GatewayError>;

    /// Append a turn. Returns `false` when the turn identity was already
    /// stored and nothing was written.
    async fn append_turn(&self, conversation_id: &str, turn: Turn) -> Result<bool, GatewayError>;

    async fn get_conversation(&self, id: &str) -> Result<ConversationDetail, GatewayError>;

    /// All conversations, most recently updated first.
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, GatewayError>;

    async fn rename_conversation(&self, id: &str, title: &str) -> Result<(), GatewayError>;

    async fn update_system_prompt(
        &self,
        id: &str,
        system_prompt: Option<&str>,
    ) -> Result<(), GatewayError>;

    /// Hard delete of the conversation and its turns. No undo.
    async fn delete_conversation(&self, id: &str) -> Result<(), GatewayError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, GatewayError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                GatewayError::invalid_spec(format!(
                    "cannot create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        migrate(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, GatewayError> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }
}

fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL DEFAULT 'New Chat',
            system_prompt TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            turn_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            provider TEXT,
            model TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, seq);
        CREATE INDEX IF NOT EXISTS idx_messages_turn
            ON messages(turn_id);
        "#,
    )
}

fn message_from_row(row: &rusqlite::Row<'_>) -> Result<StoredMessage, rusqlite::Error> {
    Ok(StoredMessage {
        id: row.get("id")?,
        conversation_id: row.get("conversation_id")?,
        turn_id: row.get("turn_id")?,
        role: row.get("role")?,
        content: row.get("content")?,
        provider: row.get("provider")?,
        model: row.get("model")?,
        created_at: row.get("created_at")?,
    })
}

fn clip_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn create_conversation(
        &self,
        title: Option<String>,
        system_prompt: Option<String>,
    ) -> Result<ConversationSummary, GatewayError> {
        let id = new_id();
        let title = title.unwrap_or_else(|| "New Chat".to_string());
        let now = now_iso();

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO conversations (id, title, system_prompt, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, title, system_prompt, now, now],
        )?;

        Ok(ConversationSummary {
            id,
            title,
            system_prompt,
            created_at: now.clone(),
            updated_at: now,
            preview: None,
            message_count: 0,
        })
    }

    async fn append_turn(&self, conversation_id: &str, turn: Turn) -> Result<bool, GatewayError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(GatewayError::NotFound(format!(
                "Conversation '{conversation_id}'"
            )));
        }

        let already_stored: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM messages WHERE turn_id = ?1 LIMIT 1",
                params![turn.id],
                |row| row.get(0),
            )
            .optional()?;
        if already_stored.is_some() {
            tracing::debug!(turn_id = %turn.id, "turn already persisted, skipping");
            return Ok(false);
        }

        let mut seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;

        let now = now_iso();
        for message in &turn.messages {
            seq += 1;
            tx.execute(
                "INSERT INTO messages
                     (id, conversation_id, turn_id, seq, role, content, provider, model, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    new_id(),
                    conversation_id,
                    turn.id,
                    seq,
                    message.role.as_str(),
                    message.content,
                    message.provider,
                    message.model,
                    now
                ],
            )?;
        }
        tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now, conversation_id],
        )?;

        tx.commit()?;
        Ok(true)
    }

    async fn get_conversation(&self, id: &str) -> Result<ConversationDetail, GatewayError> {
        let conn = self.conn.lock().await;

        let header = conn
            .query_row(
                "SELECT id, title, system_prompt, created_at, updated_at
                 FROM conversations WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let (id, title, system_prompt, created_at, updated_at) = match header {
            Some(fields) => fields,
            None => return Err(GatewayError::NotFound(format!("Conversation '{id}'"))),
        };

        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, turn_id, role, content, provider, model, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC",
        )?;
        let messages = stmt
            .query_map(params![id], message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ConversationDetail {
            id,
            title,
            system_prompt,
            created_at,
            updated_at,
            messages,
        })
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, GatewayError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT c.id, c.title, c.system_prompt, c.created_at, c.updated_at,
                    (SELECT content FROM messages
                         WHERE conversation_id = c.id ORDER BY seq DESC LIMIT 1) AS preview,
                    (SELECT COUNT(*) FROM messages
                         WHERE conversation_id = c.id) AS message_count
             FROM conversations c
             ORDER BY c.updated_at DESC, c.created_at DESC",
        )?;

        let summaries = stmt
            .query_map([], |row| {
                Ok(ConversationSummary {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    system_prompt: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                    preview: row
                        .get::<_, Option<String>>(5)?
                        .map(|text| clip_chars(&text, PREVIEW_MAX_CHARS)),
                    message_count: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(summaries)
    }

    async fn rename_conversation(&self, id: &str, title: &str) -> Result<(), GatewayError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, now_iso(), id],
        )?;
        if changed == 0 {
            return Err(GatewayError::NotFound(format!("Conversation '{id}'")));
        }
        Ok(())
    }

    async fn update_system_prompt(
        &self,
        id: &str,
        system_prompt: Option<&str>,
    ) -> Result<(), GatewayError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE conversations SET system_prompt = ?1, updated_at = ?2 WHERE id = ?3",
            params![system_prompt, now_iso(), id],
        )?;
        if changed == 0 {
            return Err(GatewayError::NotFound(format!("Conversation '{id}'")));
        }
        Ok(())
    }

    async fn delete_conversation(&self, id: &str) -> Result<(), GatewayError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM messages WHERE conversation_id = ?1", params![id])?;
        let changed = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(GatewayError::NotFound(format!("Conversation '{id}'")));
        }
        Ok(())
    }
}
