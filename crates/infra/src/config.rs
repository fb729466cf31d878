//! Runtime configuration.
//!
//! Configuration is plain data injected into [`Runtime`](crate::runtime::Runtime);
//! there is no global config object. Every section has defaults, so an empty
//! JSON object is a valid configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cairn_observability::LoggingConfig;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("failed to parse config JSON: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Logical application name (shows up in logs).
    pub app_name: String,
    pub event_store: EventStoreConfig,
    pub projections: ProjectionConfig,
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            app_name: "cairn".to_string(),
            event_store: EventStoreConfig::default(),
            projections: ProjectionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventStoreConfig {
    /// Retries for appends that lose an optimistic-concurrency race.
    pub append_retry: RetryPolicy,
    /// Persist a fresh snapshot once a read folded at least this many events (0 = never).
    pub snapshot_interval: u64,
    /// Events fetched per provider call when reading a stream.
    pub page_size: usize,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            append_retry: RetryPolicy::default(),
            snapshot_interval: 1,
            page_size: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// Retries for read-model writes rejected as stale.
    pub retry: RetryPolicy,
}

impl RuntimeConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Apply `CAIRN_APP_NAME`, `CAIRN_LOG` and `CAIRN_SNAPSHOT_INTERVAL`.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(name) = lookup("CAIRN_APP_NAME") {
            self.app_name = name;
        }
        if let Some(level) = lookup("CAIRN_LOG") {
            self.logging.level = level;
        }
        if let Some(raw) = lookup("CAIRN_SNAPSHOT_INTERVAL") {
            self.event_store.snapshot_interval = raw.trim().parse().map_err(|e| ConfigError::Invalid {
                key: "CAIRN_SNAPSHOT_INTERVAL",
                reason: format!("{raw:?}: {e}"),
            })?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "app_name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.event_store.page_size == 0 {
            return Err(ConfigError::Invalid {
                key: "event_store.page_size",
                reason: "must be at least 1".to_string(),
            });
        }
        for (key, policy) in [
            ("event_store.append_retry.jitter", &self.event_store.append_retry),
            ("projections.retry.jitter", &self.projections.retry),
        ] {
            if !(0.0..=1.0).contains(&policy.jitter) {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("{} is outside 0.0..=1.0", policy.jitter),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_observability::LogFormat;
    use std::collections::HashMap;

    #[test]
    fn empty_object_yields_defaults() {
        let cfg = RuntimeConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, RuntimeConfig::default());
        assert_eq!(cfg.event_store.snapshot_interval, 1);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = RuntimeConfig::from_json_str(
            r#"{
                "app_name": "shop",
                "event_store": { "page_size": 10 },
                "projections": { "retry": { "max_retries": 9 } },
                "logging": { "format": "pretty" }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.app_name, "shop");
        assert_eq!(cfg.event_store.page_size, 10);
        assert_eq!(cfg.event_store.append_retry, RetryPolicy::default());
        assert_eq!(cfg.projections.retry.max_retries, 9);
        assert_eq!(cfg.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(matches!(
            RuntimeConfig::from_json_str(r#"{ "event_store": { "page_size": 0 } }"#),
            Err(ConfigError::Invalid { key: "event_store.page_size", .. })
        ));
        assert!(matches!(
            RuntimeConfig::from_json_str(r#"{ "projections": { "retry": { "jitter": 2.0 } } }"#),
            Err(ConfigError::Invalid { key: "projections.retry.jitter", .. })
        ));
        assert!(matches!(RuntimeConfig::from_json_str("not json"), Err(ConfigError::Json { .. })));
    }

    #[test]
    fn overrides_apply_and_validate() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CAIRN_APP_NAME", "audit"),
            ("CAIRN_LOG", "debug"),
            ("CAIRN_SNAPSHOT_INTERVAL", " 25 "),
        ]);
        let mut cfg = RuntimeConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.app_name, "audit");
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.event_store.snapshot_interval, 25);

        let err = cfg
            .apply_overrides(|k| (k == "CAIRN_SNAPSHOT_INTERVAL").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "CAIRN_SNAPSHOT_INTERVAL", .. }));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = RuntimeConfig::from_file(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
