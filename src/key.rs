//! Job keys.
//!
//! A job key is the conversation id a job streams for. Keys double as file
//! names for the durable log and the task descriptor, so they are restricted
//! to a conservative character set.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Maximum accepted key length.
pub const MAX_KEY_LEN: usize = 128;

/// Validated identifier of a job (one per conversation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobKey(String);

impl JobKey {
    /// Validate and wrap a raw key.
    pub fn parse(raw: impl Into<String>) -> Result<Self, CacheError> {
        let raw = raw.into();
        let invalid = |reason: &str| CacheError::InvalidKey {
            key: raw.clone(),
            reason: reason.to_string(),
        };

        if raw.is_empty() {
            return Err(invalid("key is empty"));
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(invalid("key is too long"));
        }
        if raw.starts_with('.') {
            return Err(invalid("key may not start with '.'"));
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(invalid(&format!("unsupported character {c:?}")));
        }

        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobKey {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for JobKey {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<JobKey> for String {
    fn from(key: JobKey) -> Self {
        key.0
    }
}

impl AsRef<str> for JobKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
