//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::cache::DEFAULT_SUBSCRIBER_CAPACITY;
use crate::error::ConfigError;
use crate::executor::UpstreamConfig;
use crate::tasks::SupervisorConfig;

const ENV_DATA_DIR: &str = "STREAM_RELAY_DATA_DIR";
const ENV_DB_PATH: &str = "STREAM_RELAY_DB_PATH";
const ENV_PORT: &str = "STREAM_RELAY_PORT";
const ENV_SUBSCRIBER_CAPACITY: &str = "STREAM_RELAY_SUBSCRIBER_CAPACITY";
const ENV_JOB_TIMEOUT_SECS: &str = "STREAM_RELAY_JOB_TIMEOUT_SECS";
const ENV_UPSTREAM_URL: &str = "STREAM_RELAY_UPSTREAM_URL";
const ENV_UPSTREAM_API_KEY: &str = "STREAM_RELAY_UPSTREAM_API_KEY";

/// Engine and server configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root for fragment logs, descriptors, and the operator log.
    pub data_dir: PathBuf,
    /// History database file.
    pub db_path: PathBuf,
    /// HTTP listen port.
    pub port: u16,
    /// Per-reader channel capacity before a slow reader is detached.
    pub subscriber_capacity: usize,
    /// Optional hard limit on job run time.
    pub job_timeout: Option<Duration>,
    pub upstream_url: String,
    pub upstream_api_key: Option<SecretString>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data");
        Self {
            db_path: data_dir.join("history.db"),
            data_dir,
            port: 8080,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            job_timeout: None,
            upstream_url: "http://localhost:1234".to_string(),
            upstream_api_key: None,
        }
    }
}

impl EngineConfig {
    /// Read configuration from `STREAM_RELAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let data_dir = get(ENV_DATA_DIR).map(PathBuf::from).unwrap_or(defaults.data_dir);
        let db_path = get(ENV_DB_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("history.db"));

        let port = match get(ENV_PORT) {
            Some(raw) => parse_number::<u16>(ENV_PORT, &raw)?,
            None => defaults.port,
        };

        let subscriber_capacity = match get(ENV_SUBSCRIBER_CAPACITY) {
            Some(raw) => {
                let capacity = parse_number::<usize>(ENV_SUBSCRIBER_CAPACITY, &raw)?;
                if capacity == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: ENV_SUBSCRIBER_CAPACITY.to_string(),
                        message: "must be at least 1".to_string(),
                    });
                }
                capacity
            }
            None => defaults.subscriber_capacity,
        };

        let job_timeout = match get(ENV_JOB_TIMEOUT_SECS) {
            Some(raw) => match parse_number::<u64>(ENV_JOB_TIMEOUT_SECS, &raw)? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            None => None,
        };

        Ok(Self {
            data_dir,
            db_path,
            port,
            subscriber_capacity,
            job_timeout,
            upstream_url: get(ENV_UPSTREAM_URL).unwrap_or(defaults.upstream_url),
            upstream_api_key: get(ENV_UPSTREAM_API_KEY).map(SecretString::from),
        })
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.data_dir.join("tasks")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            job_timeout: self.job_timeout,
        }
    }

    pub fn upstream(&self) -> UpstreamConfig {
        UpstreamConfig {
            base_url: self.upstream_url.clone(),
            api_key: self.upstream_api_key.clone(),
            ..Default::default()
        }
    }
}

fn parse_number<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<EngineConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let c = config(&[]).unwrap();
        assert_eq!(c.data_dir, PathBuf::from("./data"));
        assert_eq!(c.db_path, PathBuf::from("./data/history.db"));
        assert_eq!(c.port, 8080);
        assert_eq!(c.subscriber_capacity, DEFAULT_SUBSCRIBER_CAPACITY);
        assert!(c.job_timeout.is_none());
        assert!(c.upstream_api_key.is_none());
    }

    #[test]
    fn db_path_follows_data_dir() {
        let c = config(&[(ENV_DATA_DIR, "/var/lib/relay")]).unwrap();
        assert_eq!(c.db_path, PathBuf::from("/var/lib/relay/history.db"));
        assert_eq!(c.wal_dir(), PathBuf::from("/var/lib/relay/wal"));
    }

    #[test]
    fn explicit_values_are_parsed() {
        let c = config(&[
            (ENV_PORT, "9000"),
            (ENV_SUBSCRIBER_CAPACITY, "16"),
            (ENV_JOB_TIMEOUT_SECS, "600"),
            (ENV_UPSTREAM_API_KEY, "sk-local"),
        ])
        .unwrap();
        assert_eq!(c.port, 9000);
        assert_eq!(c.subscriber_capacity, 16);
        assert_eq!(c.job_timeout, Some(Duration::from_secs(600)));
        assert_eq!(
            c.upstream_api_key.as_ref().map(|k| k.expose_secret().to_string()),
            Some("sk-local".to_string())
        );
    }

    #[test]
    fn zero_timeout_means_none() {
        let c = config(&[(ENV_JOB_TIMEOUT_SECS, "0")]).unwrap();
        assert!(c.job_timeout.is_none());
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = config(&[(ENV_PORT, "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == ENV_PORT));
        assert!(config(&[(ENV_SUBSCRIBER_CAPACITY, "0")]).is_err());
    }
}
