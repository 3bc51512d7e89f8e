//! Configuration system for loadpub.
//!
//! Values resolve in increasing precedence: built-in defaults, the TOML
//! config file, `LOADPUB_` environment variables, then command-line flags
//! (applied by the daemon). Every resolved value remembers its source so the
//! daemon can log where each setting came from.

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser, expand_home};
pub use source::{ConfigSource, ConfigValueSource, Sourced};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default TCP port agents publish to.
pub const DEFAULT_PORT: u16 = 4337;
/// Sessions idle for longer than this are released.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);
/// Periodic sweep interval when no traffic arrives.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_BATCH: usize = 1024;
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_BASE_DELAY_MS: u64 = 10;
pub const DEFAULT_VISIBILITY_POLL_MS: u64 = 100;

/// Errors raised while loading or validating configuration. All are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid environment configuration: {}", join_errors(.0))]
    Env(Vec<EnvError>),

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

fn join_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenerConfig {
    pub bind: String,
    pub port: u16,
    /// Lines longer than this are discarded.
    pub max_line_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Directory holding the catalog and one database per result set.
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .map(|dir| dir.join("loadpub"))
            .unwrap_or_else(|| PathBuf::from("loadpub-data"));
        Self { data_dir }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(with = "duration_text")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_text")]
    pub sweep_interval: Duration,
    /// Upper bound on events handed to the dispatcher at once.
    pub max_batch: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_batch: DEFAULT_MAX_BATCH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Backoff after attempt `n` is `n * base_delay_ms`.
    pub base_delay_ms: u64,
    pub visibility_poll_interval_ms: u64,
    /// Unset means wait until the row is visible.
    pub visibility_poll_limit: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            visibility_poll_interval_ms: DEFAULT_VISIBILITY_POLL_MS,
            visibility_poll_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub listener: ListenerConfig,
    pub store: StoreConfig,
    pub sessions: SessionConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

/// Resolved configuration plus the source of every setting.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: DaemonConfig,
    pub sources: Vec<ConfigValueSource>,
}

impl LoadedConfig {
    /// Record that `key` now holds `value` from `source`.
    pub fn record(&mut self, key: &'static str, value: impl ToString, source: ConfigSource) {
        let value = value.to_string();
        match self.sources.iter_mut().find(|entry| entry.key == key) {
            Some(entry) => {
                entry.value = value;
                entry.source = source;
            }
            None => self.sources.push(ConfigValueSource { key, value, source }),
        }
    }

    pub fn source_of(&self, key: &str) -> Option<ConfigSource> {
        self.sources
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.source)
    }
}

impl DaemonConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolve defaults, the optional config file and environment overrides.
    pub fn load(path: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
        let mut loaded = LoadedConfig {
            config: DaemonConfig::default(),
            sources: Vec::new(),
        };
        loaded.config.record_all(&mut loaded.sources, ConfigSource::Default);

        if let Some(path) = path {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let table: toml::Table = toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            let mut file_config = Self::from_toml_str(&text, path)?;
            file_config.store.data_dir =
                expand_home(&file_config.store.data_dir.to_string_lossy());
            let snapshot = file_config.snapshot();
            loaded.config = file_config;
            for (key, value) in snapshot {
                if table_has(&table, key) {
                    loaded.record(key, value, ConfigSource::File);
                } else {
                    loaded.record(key, value, ConfigSource::Default);
                }
            }
        }

        let mut parser = EnvParser::new();
        loaded.apply_env(&mut parser);
        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }

        Ok(loaded)
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        if self.listener.port == 0 {
            problems.push("listener.port must be non-zero".to_string());
        }
        if self.listener.bind.trim().is_empty() {
            problems.push("listener.bind must not be empty".to_string());
        }
        if self.listener.max_line_bytes < 1024 {
            problems.push("listener.max_line_bytes must be at least 1024".to_string());
        }
        if self.store.data_dir.as_os_str().is_empty() {
            problems.push("store.data_dir must not be empty".to_string());
        }
        if self.sessions.idle_timeout.is_zero() {
            problems.push("sessions.idle_timeout must be greater than zero".to_string());
        }
        if self.sessions.sweep_interval.is_zero() {
            problems.push("sessions.sweep_interval must be greater than zero".to_string());
        }
        if self.sessions.max_batch == 0 {
            problems.push("sessions.max_batch must be at least 1".to_string());
        }
        if self.retry.max_attempts == 0 {
            problems.push("retry.max_attempts must be at least 1".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    fn snapshot(&self) -> Vec<(&'static str, String)> {
        vec![
            ("listener.bind", self.listener.bind.clone()),
            ("listener.port", self.listener.port.to_string()),
            ("listener.max_line_bytes", self.listener.max_line_bytes.to_string()),
            ("store.data_dir", self.store.data_dir.display().to_string()),
            (
                "sessions.idle_timeout",
                humantime::format_duration(self.sessions.idle_timeout).to_string(),
            ),
            (
                "sessions.sweep_interval",
                humantime::format_duration(self.sessions.sweep_interval).to_string(),
            ),
            ("sessions.max_batch", self.sessions.max_batch.to_string()),
            ("retry.max_attempts", self.retry.max_attempts.to_string()),
            ("retry.base_delay_ms", self.retry.base_delay_ms.to_string()),
            (
                "retry.visibility_poll_interval_ms",
                self.retry.visibility_poll_interval_ms.to_string(),
            ),
            (
                "retry.visibility_poll_limit",
                self.retry
                    .visibility_poll_limit
                    .map_or_else(|| "unbounded".to_string(), |n| n.to_string()),
            ),
            ("logging.level", self.logging.level.clone()),
            ("logging.json", self.logging.json.to_string()),
            (
                "logging.file",
                self.logging
                    .file
                    .as_ref()
                    .map_or_else(|| "none".to_string(), |p| p.display().to_string()),
            ),
        ]
    }

    fn record_all(&self, sources: &mut Vec<ConfigValueSource>, source: ConfigSource) {
        for (key, value) in self.snapshot() {
            sources.push(ConfigValueSource { key, value, source });
        }
    }
}

impl LoadedConfig {
    fn apply_env(&mut self, parser: &mut EnvParser) {
        let defaults = self.config.clone();

        let bind = parser.get_string("BIND", &defaults.listener.bind);
        if bind.is_from_env() {
            self.record("listener.bind", &bind.value, ConfigSource::Environment);
            self.config.listener.bind = bind.value;
        }

        let port = parser.get_u16_range("PORT", defaults.listener.port, 1, u16::MAX);
        if port.is_from_env() {
            self.record("listener.port", port.value, ConfigSource::Environment);
            self.config.listener.port = port.value;
        }

        let data_dir = parser.get_path("DATA_DIR", &defaults.store.data_dir.to_string_lossy());
        if data_dir.is_from_env() {
            self.record(
                "store.data_dir",
                data_dir.value.display(),
                ConfigSource::Environment,
            );
            self.config.store.data_dir = data_dir.value;
        }

        let idle = parser.get_duration("IDLE_TIMEOUT", defaults.sessions.idle_timeout);
        if idle.is_from_env() {
            self.record(
                "sessions.idle_timeout",
                humantime::format_duration(idle.value),
                ConfigSource::Environment,
            );
            self.config.sessions.idle_timeout = idle.value;
        }

        let attempts = parser.get_u32_range("RETRY_ATTEMPTS", defaults.retry.max_attempts, 1, 1000);
        if attempts.is_from_env() {
            self.record("retry.max_attempts", attempts.value, ConfigSource::Environment);
            self.config.retry.max_attempts = attempts.value;
        }

        let level = parser.get_log_level("LOG_LEVEL", &defaults.logging.level);
        if level.is_from_env() {
            self.record("logging.level", &level.value, ConfigSource::Environment);
            self.config.logging.level = level.value;
        }

        let json = parser.get_bool("LOG_JSON", defaults.logging.json);
        if json.is_from_env() {
            self.record("logging.json", json.value, ConfigSource::Environment);
            self.config.logging.json = json.value;
        }

        let file = parser.get_optional_string("LOG_FILE");
        if file.is_from_env() {
            let path = file.value.map(|p| expand_home(&p));
            self.record(
                "logging.file",
                path.as_ref()
                    .map_or_else(|| "none".to_string(), |p| p.display().to_string()),
                ConfigSource::Environment,
            );
            self.config.logging.file = path;
        }
    }
}

fn table_has(table: &toml::Table, dotted_key: &str) -> bool {
    let Some((section, key)) = dotted_key.split_once('.') else {
        return table.contains_key(dotted_key);
    };
    table
        .get(section)
        .and_then(toml::Value::as_table)
        .is_some_and(|section| section.contains_key(key))
}

/// Serde adapter for durations written in humantime syntax.
mod duration_text {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom)
    }
}
