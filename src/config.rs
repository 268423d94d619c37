//! Engine configuration: TOML file, environment overrides, validation.
//!
//! Every field has a default, so an empty (or absent) file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_COMPRESSION_LEVEL;
use crate::error::ConfigError;

pub const ENV_LOG_LEVEL: &str = "CHESS_SESSION_LOG_LEVEL";
pub const ENV_SQLITE_PATH: &str = "CHESS_SESSION_SQLITE_PATH";
pub const ENV_LOAD_TIMEOUT_MS: &str = "CHESS_SESSION_LOAD_TIMEOUT_MS";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub registry: RegistryConfig,
    pub codec: CodecConfig,
    pub storage: StorageConfig,
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
}

/// Session registry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Deadline for each session store call, in milliseconds. 0 = no deadline. Default: 5000.
    pub load_timeout_ms: u64,
    /// Sessions idle longer than this are evicted by `evict_idle`. Default: 600.
    pub idle_timeout_secs: u64,
    /// Persist a session as soon as it reaches a terminal status. Default: true.
    pub persist_on_terminal: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            load_timeout_ms: 5_000,
            idle_timeout_secs: 600,
            persist_on_terminal: true,
        }
    }
}

impl RegistryConfig {
    pub fn load_timeout(&self) -> Option<Duration> {
        (self.load_timeout_ms > 0).then(|| Duration::from_millis(self.load_timeout_ms))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// zstd level, 1..=22. Default: 3.
    pub compression_level: i32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Database file for the `sqlite` backend.
    pub sqlite_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Tokio worker threads. Default: number of CPUs.
    pub worker_threads: Option<usize>,
}

impl RuntimeConfig {
    pub fn worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(num_cpus::get)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence. Default: "info".
    pub level: String,
    /// Emit JSON lines instead of human-readable output. Default: false.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// An environment override that was present but could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoredOverride {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

impl EngineConfig {
    /// Load from `path` (defaults when `None`), then apply environment
    /// overrides and validate. Also returns the overrides that were
    /// ignored, since this usually runs before logging is installed.
    pub fn load(path: Option<&Path>) -> Result<(Self, Vec<IgnoredOverride>), ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        let ignored = config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok((config, ignored))
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    /// Unparseable values leave the setting unchanged and are returned.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Vec<IgnoredOverride> {
        let read = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let mut ignored = Vec::new();

        if let Some(level) = read(ENV_LOG_LEVEL) {
            self.logging.level = level;
        }
        if let Some(path) = read(ENV_SQLITE_PATH) {
            self.storage.backend = StorageBackend::Sqlite;
            self.storage.sqlite_path = Some(PathBuf::from(path));
        }
        if let Some(value) = read(ENV_LOAD_TIMEOUT_MS) {
            match value.parse() {
                Ok(ms) => self.registry.load_timeout_ms = ms,
                Err(err) => ignored.push(IgnoredOverride {
                    key: ENV_LOAD_TIMEOUT_MS,
                    value,
                    reason: format!("not a u64: {err}"),
                }),
            }
        }
        ignored
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=22).contains(&self.codec.compression_level) {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "codec.compression_level must be in 1..=22, got {}",
                    self.codec.compression_level
                ),
            });
        }
        if self.registry.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                reason: "registry.idle_timeout_secs must be >= 1".to_string(),
            });
        }
        if self.runtime.worker_threads == Some(0) {
            return Err(ConfigError::Invalid {
                reason: "runtime.worker_threads must be >= 1".to_string(),
            });
        }
        if self.storage.backend == StorageBackend::Sqlite && self.storage.sqlite_path.is_none() {
            return Err(ConfigError::Invalid {
                reason: "storage.sqlite_path is required for the sqlite backend".to_string(),
            });
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "logging.level must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.registry.load_timeout(), Some(Duration::from_millis(5_000)));
        assert_eq!(config.registry.idle_timeout(), Duration::from_secs(600));
        assert!(config.registry.persist_on_terminal);
        assert_eq!(config.codec.compression_level, 3);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert!(config.runtime.worker_threads() >= 1);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [registry]
            load_timeout_ms = 0

            [storage]
            backend = "sqlite"
            sqlite_path = "/tmp/games.db"
            "#,
        )
        .unwrap();
        assert_eq!(config.registry.load_timeout(), None);
        assert_eq!(config.registry.idle_timeout_secs, 600);
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.logging, LoggingConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.codec.compression_level = 0;
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("compression_level"), "got: {msg}");

        let mut config = EngineConfig::default();
        config.storage.backend = StorageBackend::Sqlite;
        assert!(config.validate().is_err());

        assert!(matches!(
            EngineConfig::from_toml("[registry]\nload_timeout_ms = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn environment_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_LOG_LEVEL, "debug"),
            (ENV_SQLITE_PATH, "/var/lib/chess.db"),
            (ENV_LOAD_TIMEOUT_MS, "not-a-number"),
        ]);
        let mut config = EngineConfig::default();
        let ignored = config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.storage.sqlite_path, Some(PathBuf::from("/var/lib/chess.db")));
        // Invalid value leaves the default in place and is reported
        assert_eq!(config.registry.load_timeout_ms, 5_000);
        assert_eq!(ignored.len(), 1);
        assert_eq!(ignored[0].key, ENV_LOAD_TIMEOUT_MS);
        assert_eq!(ignored[0].value, "not-a-number");
    }

    #[test]
    fn valid_overrides_report_nothing() {
        let mut config = EngineConfig::default();
        let ignored = config.apply_overrides(|k| (k == ENV_LOAD_TIMEOUT_MS).then(|| "250".to_string()));
        assert!(ignored.is_empty());
        assert_eq!(config.registry.load_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = EngineConfig::load(Some(Path::new("/nonexistent/chess.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
