//! History persistence: the hand-off point for finished artifacts.

mod libsql_backend;
mod migrations;
mod traits;

pub use libsql_backend::LibSqlHistory;
pub use traits::{ArtifactMetadata, ChatSummary, HistoryStore, StoredMessage};
