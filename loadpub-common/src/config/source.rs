//! Source tracking for configuration values.

use serde::Serialize;
use std::fmt;

/// Where a configuration value came from, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
    Cli,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::File => write!(f, "config file"),
            Self::Environment => write!(f, "environment"),
            Self::Cli => write!(f, "command line"),
        }
    }
}

/// A value paired with its source and, for environment values, the variable name.
#[derive(Debug, Clone, PartialEq)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    pub var: Option<String>,
}

impl<T> Sourced<T> {
    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
            var: None,
        }
    }

    pub fn from_env(value: T, var: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigSource::Environment,
            var: Some(var.into()),
        }
    }

    /// Whether the value was explicitly provided by the environment.
    pub fn is_from_env(&self) -> bool {
        self.source == ConfigSource::Environment
    }
}

/// One line of the resolved-configuration report logged at startup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigValueSource {
    pub key: &'static str,
    pub value: String,
    pub source: ConfigSource,
}
