//! Logging bootstrap shared by loadpub binaries.
//!
//! Builds a `tracing-subscriber` registry with an env filter, a stderr layer
//! (human or JSON) and an optional daily-rolling JSON file layer.

use std::path::PathBuf;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {source}")]
    Filter {
        filter: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("log file path {0} has no file name")]
    FileName(PathBuf),

    #[error("failed to install tracing subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `loadpubd=debug,info`.
    pub level: String,
    pub json: bool,
    pub stderr: bool,
    /// Rolling log file; rotated daily.
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// Start from `RUST_LOG` when set, otherwise `default_level`.
    pub fn from_env(default_level: &str) -> Self {
        let level = std::env::var("RUST_LOG")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| default_level.to_string());
        Self {
            level,
            json: false,
            stderr: false,
            file: None,
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn with_file(mut self, file: Option<PathBuf>) -> Self {
        self.file = file;
        self
    }
}

/// Keeps the non-blocking file writer alive; drop it at process exit.
#[derive(Default)]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards, LoggingError> {
    let filter = EnvFilter::try_new(&config.level).map_err(|source| LoggingError::Filter {
        filter: config.level.clone(),
        source,
    })?;

    let human = (config.stderr && !config.json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
    });
    let json = (config.stderr && config.json).then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
    });

    let mut guards = LoggingGuards::default();
    let file = match &config.file {
        Some(path) => {
            let file_name = path
                .file_name()
                .ok_or_else(|| LoggingError::FileName(path.clone()))?;
            let directory = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards._file = Some(guard);
            Some(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_thread_ids(true),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(human)
        .with(json)
        .with(file)
        .try_init()?;

    Ok(guards)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let config = LogConfig::from_env("info")
            .with_level("debug")
            .with_stderr()
            .with_json(true)
            .with_file(Some(PathBuf::from("/tmp/loadpub.log")));
        assert_eq!(config.level, "debug");
        assert!(config.stderr);
        assert!(config.json);
        assert_eq!(config.file, Some(PathBuf::from("/tmp/loadpub.log")));
    }

    #[test]
    fn invalid_filter_is_rejected() {
        let config = LogConfig::from_env("info").with_level("info,loadpubd=verbose");
        assert!(matches!(init_logging(&config), Err(LoggingError::Filter { .. })));
    }
}
