mod options;
mod server;

pub use options::*;
pub use server::*;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a manager needs at construction: the named server table and
/// the effective options.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ClientConfig {
    /// Server descriptors keyed by the name callers activate them with.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerDescriptor>,
    #[serde(default)]
    pub options: ClientOptions,
}

impl ClientConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Load from a `.toml` or `.json` file, picked by extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            Some("toml") | None => Self::from_toml_str(&raw),
            Some(other) => Err(Error::Config(format!(
                "unsupported config extension `.{other}` (expected .toml or .json)"
            ))),
        }
    }

    /// Add or replace one server entry.
    pub fn with_server(mut self, name: impl Into<String>, descriptor: ServerDescriptor) -> Self {
        self.servers.insert(name.into(), descriptor);
        self
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    pub fn server(&self, name: &str) -> Result<&ServerDescriptor> {
        self.servers
            .get(name)
            .ok_or_else(|| Error::UnknownServer(name.to_string()))
    }
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
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl ClientConfig {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        for (name, desc) in &self.servers {
            if name.trim().is_empty() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: "servers".into(),
                    message: "server name must not be empty".into(),
                });
            }
            match &desc.transport {
                TransportSpec::Process { command, .. } if command.trim().is_empty() => {
                    issues.push(ConfigIssue {
                        severity: ConfigSeverity::Error,
                        field: format!("servers.{name}.command"),
                        message: "command must not be empty".into(),
                    });
                }
                TransportSpec::Stream { url, .. }
                    if !(url.starts_with("http://") || url.starts_with("https://")) =>
                {
                    issues.push(ConfigIssue {
                        severity: ConfigSeverity::Error,
                        field: format!("servers.{name}.url"),
                        message: "url must be an http(s) URL".into(),
                    });
                }
                _ => {}
            }
        }

        if self.options.request_timeout_ms == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "options.request_timeout_ms".into(),
                message: "0 disables request deadlines; requests may wait forever".into(),
            });
        }

        if !self.options.benign_exit_codes.contains(&0) {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "options.benign_exit_codes".into(),
                message: "exit code 0 is not treated as a clean shutdown".into(),
            });
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_defaults() {
        let cfg: ClientConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.servers.is_empty());
        assert_eq!(cfg.options, ClientOptions::default());
    }

    #[test]
    fn unknown_server_lookup() {
        let cfg = ClientConfig::default();
        assert!(matches!(cfg.server("nope"), Err(Error::UnknownServer(n)) if n == "nope"));
    }

    #[test]
    fn validate_flags_empty_command_and_bad_url() {
        let cfg = ClientConfig::default()
            .with_server("a", ServerDescriptor::process("", Vec::<String>::new()))
            .with_server("b", ServerDescriptor::stream("ftp://nope"));
        let issues = cfg.validate();
        assert!(issues.iter().any(|i| i.field == "servers.a.command"));
        assert!(issues.iter().any(|i| i.field == "servers.b.url"));
        assert!(issues.iter().all(|i| i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn valid_config_has_no_issues() {
        let cfg = ClientConfig::default()
            .with_server("fs", ServerDescriptor::process("npx", ["server"]))
            .with_server("remote", ServerDescriptor::stream("https://mcp.example.com/sse"));
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn issue_display() {
        let issue = ConfigIssue {
            severity: ConfigSeverity::Warning,
            field: "options.request_timeout_ms".into(),
            message: "disabled".into(),
        };
        assert_eq!(issue.to_string(), "[WARN] options.request_timeout_ms: disabled");
    }
}
