//! On-disk task descriptors, one JSON file per job key.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

use super::state::TaskDescriptor;
use crate::error::TaskError;
use crate::key::JobKey;

/// Placeholder written over inline image payloads before persisting.
pub const STRIPPED_IMAGE_PLACEHOLDER: &str = "[image data stripped for storage]";

/// Directory of task descriptors.
///
/// Writes go to a temp file that is renamed into place, so a crash leaves
/// either the old or the new descriptor, never a torn one.
pub struct DescriptorStore {
    dir: PathBuf,
    locks: Mutex<HashMap<JobKey, Arc<Mutex<()>>>>,
}

impl DescriptorStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, TaskError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| TaskError::Descriptor {
                key: dir.display().to_string(),
                reason: format!("cannot create descriptor directory: {e}"),
            })?;
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &JobKey) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    async fn lock_for(&self, key: &JobKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Drop the key's lock from the map once no other caller holds it.
    async fn release(&self, key: &JobKey, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }

    /// Write a descriptor, replacing any previous one for the key.
    pub async fn create(&self, descriptor: &TaskDescriptor) -> Result<(), TaskError> {
        let lock = self.lock_for(&descriptor.key).await;
        let result = {
            let _guard = lock.lock().await;
            self.write(descriptor).await
        };
        self.release(&descriptor.key, lock).await;
        result
    }

    pub async fn get(&self, key: &JobKey) -> Result<Option<TaskDescriptor>, TaskError> {
        let lock = self.lock_for(key).await;
        let result = {
            let _guard = lock.lock().await;
            self.read(key).await
        };
        self.release(key, lock).await;
        result
    }

    /// Read-modify-write under the key's lock.
    pub async fn update<F, R>(&self, key: &JobKey, f: F) -> Result<R, TaskError>
    where
        F: FnOnce(&mut TaskDescriptor) -> R,
    {
        let lock = self.lock_for(key).await;
        let result = {
            let _guard = lock.lock().await;
            self.modify(key, f).await
        };
        self.release(key, lock).await;
        result
    }

    async fn modify<F, R>(&self, key: &JobKey, f: F) -> Result<R, TaskError>
    where
        F: FnOnce(&mut TaskDescriptor) -> R,
    {
        let mut descriptor = self.read(key).await?.ok_or_else(|| TaskError::NotFound {
            key: key.to_string(),
        })?;
        let result = f(&mut descriptor);
        self.write(&descriptor).await?;
        Ok(result)
    }

    /// Every readable descriptor. Unreadable files are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<TaskDescriptor>, TaskError> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| self.io_error("*", "cannot list descriptors", e))?;

        let mut descriptors = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| self.io_error("*", "cannot list descriptors", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = match fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable descriptor");
                    continue;
                }
            };
            match serde_json::from_str::<TaskDescriptor>(&raw) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping malformed descriptor");
                }
            }
        }
        descriptors.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(descriptors)
    }

    async fn read(&self, key: &JobKey) -> Result<Option<TaskDescriptor>, TaskError> {
        let raw = match fs::read_to_string(self.path(key)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(key.as_str(), "cannot read descriptor", e)),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| TaskError::Descriptor {
                key: key.to_string(),
                reason: format!("malformed descriptor: {e}"),
            })
    }

    async fn write(&self, descriptor: &TaskDescriptor) -> Result<(), TaskError> {
        let key = &descriptor.key;
        let body = serde_json::to_vec_pretty(descriptor).map_err(|e| TaskError::Descriptor {
            key: key.to_string(),
            reason: format!("cannot serialize descriptor: {e}"),
        })?;

        let target = self.path(key);
        let tmp = self.dir.join(format!("{key}.json.tmp"));
        fs::write(&tmp, body)
            .await
            .map_err(|e| self.io_error(key.as_str(), "cannot write descriptor", e))?;
        fs::rename(&tmp, &target)
            .await
            .map_err(|e| self.io_error(key.as_str(), "cannot replace descriptor", e))
    }

    fn io_error(&self, key: &str, what: &str, e: std::io::Error) -> TaskError {
        TaskError::Descriptor {
            key: key.to_string(),
            reason: format!("{what} in {}: {e}", self.dir.display()),
        }
    }
}

/// Replace inline image payloads in chat messages with a placeholder.
///
/// Only `image_url` parts of array-valued `content` are touched.
pub fn strip_inline_images(messages: &[Value]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| {
            let mut message = message.clone();
            if let Some(Value::Array(parts)) = message.get_mut("content") {
                for part in parts.iter_mut() {
                    if part.get("type").and_then(Value::as_str) != Some("image_url") {
                        continue;
                    }
                    if let Some(image) = part.get_mut("image_url").and_then(Value::as_object_mut) {
                        if image.contains_key("url") {
                            image.insert("url".into(), Value::from(STRIPPED_IMAGE_PLACEHOLDER));
                        }
                    }
                }
            }
            message
        })
        .collect()
}
