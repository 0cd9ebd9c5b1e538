//! Append-only on-disk fragment log, one JSON-lines file per job.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::fragment::Fragment;
use crate::key::JobKey;

const LOG_EXTENSION: &str = "wal";

/// Directory of per-job fragment logs.
#[derive(Debug, Clone)]
pub struct FragmentLog {
    dir: PathBuf,
}

impl FragmentLog {
    /// Open (creating if needed) the log directory.
    pub async fn open(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log for `key`.
    pub fn path(&self, key: &JobKey) -> PathBuf {
        self.dir.join(format!("{key}.{LOG_EXTENSION}"))
    }

    /// Create or truncate the log for `key` and return a writer positioned at its end.
    pub async fn create(&self, key: &JobKey) -> std::io::Result<LogWriter> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.path(key))
            .await?;
        Ok(LogWriter { file })
    }

    pub async fn exists(&self, key: &JobKey) -> bool {
        fs::try_exists(self.path(key)).await.unwrap_or(false)
    }

    /// Append one record to a log without holding a writer.
    ///
    /// Used for logs of jobs that have no live worker (startup recovery).
    pub async fn append_detached(&self, key: &JobKey, fragment: &Fragment) -> std::io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(key))
            .await?;
        let mut writer = LogWriter { file };
        writer.append(fragment).await
    }

    /// Read every fragment recorded for `key`, in order.
    ///
    /// Returns `Ok(None)` when no log exists. Lines that fail to parse (a torn
    /// final write) are skipped.
    pub async fn replay(&self, key: &JobKey) -> std::io::Result<Option<Vec<Fragment>>> {
        let raw = match fs::read_to_string(self.path(key)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut fragments = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Fragment>(line) {
                Ok(fragment) => fragments.push(fragment),
                Err(e) => {
                    warn!(job_key = %key, line = line_no + 1, error = %e, "Skipping unreadable log record");
                }
            }
        }
        Ok(Some(fragments))
    }

    /// Delete the log for `key`. Missing logs are not an error.
    pub async fn remove(&self, key: &JobKey) -> std::io::Result<()> {
        match fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Open handle on one job's log.
#[derive(Debug)]
pub struct LogWriter {
    file: File,
}

impl LogWriter {
    /// Write one fragment as a JSON line and flush it to the OS.
    pub async fn append(&mut self, fragment: &Fragment) -> std::io::Result<()> {
        let mut line = serde_json::to_string(fragment)?;
        line.push('\n');
        self.file.write_all(line.as_bytes()).await?;
        self.file.flush().await
    }
}
