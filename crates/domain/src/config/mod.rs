mod observability;
mod sessions;

pub use observability::*;
pub use sessions::*;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.sessions.deployment.trim().is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "sessions.deployment".into(),
                message: "deployment must not be empty".into(),
            });
        }

        if self.sessions.default_max_idle_secs == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "sessions.default_max_idle_secs".into(),
                message: "sessions never expire (max idle is 0)".into(),
            });
        }

        let mut seen = HashSet::new();
        for (i, index) in self.sessions.indexes.iter().enumerate() {
            if index.name.is_empty() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("sessions.indexes[{i}].name"),
                    message: "index name must not be empty".into(),
                });
            } else if !seen.insert(index.name.as_str()) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("sessions.indexes[{i}].name"),
                    message: format!("duplicate index name \"{}\"", index.name),
                });
            }
            if index.attribute.is_empty() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("sessions.indexes[{i}].attribute"),
                    message: "index attribute must not be empty".into(),
                });
            }
        }

        let format = self.observability.log_format.to_ascii_lowercase();
        if format != "json" && format != "compact" {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "observability.log_format".into(),
                message: format!(
                    "unknown log format \"{}\" (expected \"compact\" or \"json\")",
                    self.observability.log_format
                ),
            });
        }

        errors
    }
}
