//! Fragment and artifact types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One immutable unit of a job's output stream.
///
/// `Chunk` carries executor output verbatim. `Error` and `Done` are the two
/// sentinels: `Error` is delivered like any other fragment, `Done` ends every
/// reader's stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fragment {
    /// Content produced by the executor.
    Chunk {
        data: String,
        timestamp: DateTime<Utc>,
    },
    /// The job failed, was stopped, or died with the process.
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// End of stream.
    Done,
}

impl Fragment {
    pub fn chunk(data: impl Into<String>) -> Self {
        Self::Chunk {
            data: data.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Chunk payload, `None` for sentinels.
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Chunk { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Capture time, `None` for `Done`.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Chunk { timestamp, .. } | Self::Error { timestamp, .. } => Some(*timestamp),
            Self::Done => None,
        }
    }
}

/// Aggregated output of a job, handed to the history store once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalArtifact {
    /// Aggregated content.
    pub content: String,
    /// Number of content chunks that went into `content`.
    pub chunk_count: usize,
}

impl FinalArtifact {
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_tagged() {
        let json = serde_json::to_value(Fragment::Done).unwrap();
        assert_eq!(json, serde_json::json!({"type": "done"}));

        let chunk = Fragment::chunk("hello");
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["type"], "chunk");
        assert_eq!(json["data"], "hello");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn timestamps_survive_serialization_exactly() {
        let original = Fragment::error("boom");
        let line = serde_json::to_string(&original).unwrap();
        let parsed: Fragment = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn sentinels_have_no_content() {
        assert_eq!(Fragment::chunk("a").content(), Some("a"));
        assert_eq!(Fragment::error("x").content(), None);
        assert_eq!(Fragment::Done.content(), None);
        assert!(Fragment::Done.timestamp().is_none());
    }
}
