mod peer;
mod session;

pub use peer::*;
pub use session::*;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub peer: PeerConfig,
    #[serde(default)]
    pub session: SessionConfig,
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

        if self.peer.command.trim().is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "peer.command".into(),
                message: "command must not be empty".into(),
            });
        }

        if self.peer.read_timeout_ms == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "peer.read_timeout_ms".into(),
                message: "0 disables the read timeout; a hung peer will block the session forever"
                    .into(),
            });
        }

        if self.session.protocol_version.trim().is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "session.protocol_version".into(),
                message: "protocol_version must not be empty".into(),
            });
        }

        if !self.session.capabilities.is_object() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "session.capabilities".into(),
                message: "capabilities must be a table".into(),
            });
        }

        for (i, call) in self.session.calls.iter().enumerate() {
            if call.name.trim().is_empty() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("session.calls[{i}].name"),
                    message: "tool name must not be empty".into(),
                });
            }
            if !call.arguments.is_object() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("session.calls[{i}].arguments"),
                    message: "arguments must be a table".into(),
                });
            }
        }

        errors
    }

    /// Fail with [`Error::Config`] if [`validate`](Self::validate) reports
    /// any error-severity issue. Warnings are logged and ignored.
    pub fn ensure_valid(&self) -> Result<()> {
        let mut fatal = Vec::new();
        for issue in self.validate() {
            match issue.severity {
                ConfigSeverity::Warning => {
                    tracing::warn!(field = %issue.field, "{}", issue.message);
                }
                ConfigSeverity::Error => fatal.push(issue.to_string()),
            }
        }
        if fatal.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(fatal.join("; ")))
        }
    }
}
