use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::record::EntityType;
use crate::queue::retry::BackoffKind;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Operations dispatched per batch.
    pub batch_size: usize,
    /// Minimum quiet gap between the end of one batch and the start of the next.
    pub batch_interval_ms: u64,
    /// Upper bound on a single reconciler call.
    pub operation_timeout_ms: u64,
    /// Dispatcher timer tick, in addition to enqueue wake-ups.
    pub poll_interval_ms: u64,
    pub coalesce_duplicates: bool,
    pub log_successes: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_interval_ms: 1_000,
            operation_timeout_ms: 30_000,
            poll_interval_ms: 5_000,
            coalesce_duplicates: true,
            log_successes: false,
        }
    }
}

impl QueueConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff: BackoffKind,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub overrides: BTreeMap<EntityType, RetryOverride>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 5_000,
            backoff: BackoffKind::Linear,
            max_delay_ms: 300_000,
            jitter_ms: 0,
            overrides: BTreeMap::new(),
        }
    }
}

/// Per-entity-type adjustments; unset fields inherit from [`RetryConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOverride {
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub backoff: Option<BackoffKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Pending work and the sync log live in process memory only.
    Memory,
    Sled { data_dir: String },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Defaults, then the JSON file if given, then `KITCHEN_SYNC_*`
    /// environment variables. The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, "KITCHEN_SYNC_BATCH_SIZE")? {
            self.queue.batch_size = v;
        }
        if let Some(v) = parse_var(&lookup, "KITCHEN_SYNC_BATCH_INTERVAL_MS")? {
            self.queue.batch_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "KITCHEN_SYNC_OPERATION_TIMEOUT_MS")? {
            self.queue.operation_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "KITCHEN_SYNC_MAX_RETRIES")? {
            self.retry.max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "KITCHEN_SYNC_RETRY_DELAY_MS")? {
            self.retry.base_delay_ms = v;
        }
        if let Some(dir) = lookup("KITCHEN_SYNC_DATA_DIR").filter(|d| !d.trim().is_empty()) {
            self.storage = StorageConfig::Sled { data_dir: dir };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.batch_size == 0 {
            return Err(ConfigError::Invalid("queue.batch_size must be at least 1".into()));
        }
        if self.queue.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "queue.operation_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.queue.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "queue.poll_interval_ms must be greater than 0".into(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }
        if let StorageConfig::Sled { data_dir } = &self.storage {
            if data_dir.trim().is_empty() {
                return Err(ConfigError::Invalid("storage.data_dir is empty".into()));
            }
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value: raw,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn config_default_values_match_reference_queue() {
        let cfg = Config::default();
        assert_eq!(cfg.queue.batch_size, 10);
        assert_eq!(cfg.queue.batch_interval(), Duration::from_secs(1));
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.backoff, BackoffKind::Linear);
        assert!(!cfg.queue.log_successes);
        assert_eq!(cfg.storage, StorageConfig::Memory);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults_for_missing_fields() {
        let raw = r#"{
            "queue": { "batch_size": 25 },
            "retry": {
                "backoff": "exponential",
                "overrides": { "employee": { "max_retries": 5 } }
            },
            "storage": { "type": "sled", "data_dir": "/var/lib/kitchen-sync" }
        }"#;

        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.queue.batch_size, 25);
        assert_eq!(cfg.queue.batch_interval_ms, 1_000);
        assert_eq!(cfg.retry.backoff, BackoffKind::Exponential);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(
            cfg.retry.overrides.get(&EntityType::Employee).and_then(|o| o.max_retries),
            Some(5)
        );
        match cfg.storage {
            StorageConfig::Sled { data_dir } => assert_eq!(data_dir, "/var/lib/kitchen-sync"),
            other => panic!("expected sled storage, got {other:?}"),
        }
    }

    #[test]
    fn env_overrides_apply_and_reject_garbage() {
        let vars: HashMap<&str, &str> = [
            ("KITCHEN_SYNC_BATCH_SIZE", "4"),
            ("KITCHEN_SYNC_MAX_RETRIES", "1"),
            ("KITCHEN_SYNC_DATA_DIR", "/tmp/ks"),
        ]
        .into_iter()
        .collect();

        let mut cfg = Config::default();
        cfg.apply_overrides(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.queue.batch_size, 4);
        assert_eq!(cfg.retry.max_retries, 1);
        assert_eq!(
            cfg.storage,
            StorageConfig::Sled {
                data_dir: "/tmp/ks".into()
            }
        );

        let mut cfg = Config::default();
        let err = cfg
            .apply_overrides(|k| (k == "KITCHEN_SYNC_BATCH_SIZE").then(|| "ten".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn validate_rejects_unusable_values() {
        let mut cfg = Config::default();
        cfg.queue.batch_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.retry.max_delay_ms = 10;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.queue.operation_timeout_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, r#"{ "queue": { "log_successes": true } }"#).unwrap();

        let cfg = Config::from_file(&path).unwrap();
        assert!(cfg.queue.log_successes);
        assert!(Config::from_file(dir.path().join("missing.json")).is_err());
    }
}
