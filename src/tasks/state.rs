//! Task status state machine and the persisted descriptor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TaskError;
use crate::key::JobKey;

/// Cap on recorded transitions per descriptor.
const MAX_TRANSITIONS: usize = 200;

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// A worker is (or, before recovery, was) driving the executor.
    Running,
    /// The executor finished and the artifact was handed off.
    Completed,
    /// The executor failed.
    Failed,
    /// Stopped by a user or by a restart.
    Interrupted,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Running, Completed) | (Running, Failed) | (Running, Interrupted)
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        };
        write!(f, "{s}")
    }
}

/// A recorded status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Parameters a task was started with.
///
/// Opaque to the engine beyond the model name; the executor interprets the
/// rest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    /// Model the executor should use.
    #[serde(default)]
    pub model: String,
    /// Conversation history in chat-completion message format.
    #[serde(default)]
    pub messages: Vec<Value>,
    /// Mode switches and executor-specific options.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, Value>,
}

impl TaskParams {
    pub fn new(model: impl Into<String>, messages: Vec<Value>) -> Self {
        Self {
            model: model.into(),
            messages,
            options: serde_json::Map::new(),
        }
    }

    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    /// Text of the last message with role `user`, if any.
    pub fn last_user_message(&self) -> Option<String> {
        let message = self
            .messages
            .iter()
            .rev()
            .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))?;

        match message.get("content")? {
            Value::String(text) => Some(text.clone()),
            Value::Array(parts) => {
                let text: Vec<&str> = parts
                    .iter()
                    .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect();
                (!text.is_empty()).then(|| text.join("\n"))
            }
            _ => None,
        }
    }
}

/// Persisted record of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub key: JobKey,
    pub status: TaskStatus,
    pub params: TaskParams,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Error recorded when the task failed or was interrupted.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub transitions: Vec<StateTransition>,
}

impl TaskDescriptor {
    /// A fresh descriptor in state `running`.
    pub fn running(key: JobKey, params: TaskParams) -> Self {
        let now = Utc::now();
        Self {
            key,
            status: TaskStatus::Running,
            params,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            transitions: Vec::new(),
        }
    }

    /// Move to `target`, recording the transition.
    pub fn transition_to(
        &mut self,
        target: TaskStatus,
        reason: Option<String>,
    ) -> Result<(), TaskError> {
        if !self.status.can_transition_to(target) {
            return Err(TaskError::InvalidTransition {
                key: self.key.to_string(),
                state: self.status.to_string(),
                target: target.to_string(),
            });
        }

        let now = Utc::now();
        self.transitions.push(StateTransition {
            from: self.status,
            to: target,
            timestamp: now,
            reason,
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.status = target;
        self.updated_at = now;
        if target.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Terminal transition that also records an error message.
    pub fn finish_with_error(
        &mut self,
        target: TaskStatus,
        error: impl Into<String>,
    ) -> Result<(), TaskError> {
        let error = error.into();
        self.transition_to(target, Some(error.clone()))?;
        self.error = Some(error);
        Ok(())
    }
}
