//! History storage boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::FinalArtifact;
use crate::error::DatabaseError;
use crate::key::JobKey;
use crate::tasks::TaskStatus;

/// Context recorded alongside a job's artifact.
#[derive(Debug, Clone)]
pub struct ArtifactMetadata {
    pub model: String,
    /// Terminal status the job reached.
    pub status: TaskStatus,
    pub executor: String,
}

/// A message of a stored conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    pub model: Option<String>,
    pub status: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Conversation header.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatSummary {
    pub id: String,
    pub title: Option<String>,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable owner of finished artifacts.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Store a job's final artifact. Called at most once per job.
    async fn persist(
        &self,
        key: &JobKey,
        artifact: &FinalArtifact,
        metadata: &ArtifactMetadata,
    ) -> Result<(), DatabaseError>;

    /// Append a message to a conversation, creating the conversation if needed.
    async fn add_message(&self, key: &JobKey, role: &str, content: &str) -> Result<(), DatabaseError>;

    /// Messages of a conversation, oldest first.
    async fn list_messages(&self, key: &JobKey) -> Result<Vec<StoredMessage>, DatabaseError>;

    async fn get_chat(&self, key: &JobKey) -> Result<Option<ChatSummary>, DatabaseError>;
}
