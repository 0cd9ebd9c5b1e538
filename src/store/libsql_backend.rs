//! libSQL history backend. Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::FinalArtifact;
use crate::error::DatabaseError;
use crate::key::JobKey;
use crate::store::migrations;
use crate::store::traits::{ArtifactMetadata, ChatSummary, HistoryStore, StoredMessage};

/// Longest chat title derived from a first user message.
const TITLE_MAX_CHARS: usize = 80;

/// libSQL-backed conversation history.
///
/// Holds one connection reused for every operation; `libsql::Connection` is
/// safe for concurrent async use.
pub struct LibSqlHistory {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlHistory {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let history = Self::from_database(db).await?;
        info!(path = %path.display(), "History database opened");
        Ok(history)
    }

    /// In-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn ensure_chat(
        &self,
        key: &JobKey,
        title: Option<&str>,
        model: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO chats (id, title, model, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT (id) DO UPDATE SET
                     title = COALESCE(chats.title, excluded.title),
                     model = COALESCE(excluded.model, chats.model),
                     updated_at = excluded.updated_at",
                params![key.as_str(), opt_text(title), opt_text(model), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ensure_chat: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn title_from(content: &str) -> Option<String> {
    let line = content.lines().map(str::trim).find(|l| !l.is_empty())?;
    Some(line.chars().take(TITLE_MAX_CHARS).collect())
}

fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, libsql::Error> {
    let created: String = row.get(5)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        role: row.get(1)?,
        content: row.get(2)?,
        model: row.get(3)?,
        status: row.get(4)?,
        created_at: parse_datetime(&created),
    })
}

#[async_trait]
impl HistoryStore for LibSqlHistory {
    async fn persist(
        &self,
        key: &JobKey,
        artifact: &FinalArtifact,
        metadata: &ArtifactMetadata,
    ) -> Result<(), DatabaseError> {
        let model = (!metadata.model.is_empty()).then_some(metadata.model.as_str());
        self.ensure_chat(key, None, model).await?;

        let id = Uuid::new_v4().to_string();
        let chunk_count = i64::try_from(artifact.chunk_count).unwrap_or(i64::MAX);
        self.conn()
            .execute(
                "INSERT INTO messages (id, chat_id, role, content, created_at, model, status, chunk_count)
                 VALUES (?1, ?2, 'assistant', ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.as_str(),
                    key.as_str(),
                    artifact.content.as_str(),
                    Utc::now().to_rfc3339(),
                    opt_text(model),
                    metadata.status.to_string(),
                    chunk_count
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("persist: {e}")))?;

        debug!(
            job_key = %key,
            status = %metadata.status,
            executor = %metadata.executor,
            chars = artifact.content.len(),
            "Artifact persisted"
        );
        Ok(())
    }

    async fn add_message(&self, key: &JobKey, role: &str, content: &str) -> Result<(), DatabaseError> {
        let title = (role == "user").then(|| title_from(content)).flatten();
        self.ensure_chat(key, title.as_deref(), None).await?;

        let id = Uuid::new_v4().to_string();
        self.conn()
            .execute(
                "INSERT INTO messages (id, chat_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.as_str(), key.as_str(), role, content, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_message: {e}")))?;
        Ok(())
    }

    async fn list_messages(&self, key: &JobKey) -> Result<Vec<StoredMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, role, content, model, status, created_at FROM messages
                 WHERE chat_id = ?1 ORDER BY created_at ASC, rowid ASC",
                params![key.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?
        {
            messages.push(
                row_to_message(&row)
                    .map_err(|e| DatabaseError::Serialization(format!("message row: {e}")))?,
            );
        }
        Ok(messages)
    }

    async fn get_chat(&self, key: &JobKey) -> Result<Option<ChatSummary>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, title, model, created_at, updated_at FROM chats WHERE id = ?1",
                params![key.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_chat: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_chat: {e}")))?
        else {
            return Ok(None);
        };

        let read = |e: libsql::Error| DatabaseError::Serialization(format!("chat row: {e}"));
        let created: String = row.get(3).map_err(read)?;
        let updated: String = row.get(4).map_err(read)?;
        Ok(Some(ChatSummary {
            id: row.get(0).map_err(read)?,
            title: row.get(1).map_err(read)?,
            model: row.get(2).map_err(read)?,
            created_at: parse_datetime(&created),
            updated_at: parse_datetime(&updated),
        }))
    }
}
