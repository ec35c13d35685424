//! Configuration for the AMI connection, CLI subprocesses and log tailing.
//!
//! Every section has defaults suited to a stock Asterisk install on the local host.
//! Configuration can be loaded from JSON or from the environment:
//!
//! | Variable       | Field                   |
//! |----------------|-------------------------|
//! | `AMI_HOST`     | `ami.host`              |
//! | `AMI_PORT`     | `ami.port`              |
//! | `AMI_USERNAME` | `ami.username`          |
//! | `AMI_PASSWORD` | `ami.secret`            |
//! | `ASTERISK_BIN` | `cli.asterisk_binary`   |
//! | `ASTERISK_LOG` | prepended to `logs.candidates` |

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::ObserverError;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ManagerOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub connect_timeout_ms: u64,
    /// Deadline for single-block responses.
    pub response_timeout_ms: u64,
    /// Deadline for event-list responses such as `PJSIPShowEndpoints`.
    pub listing_timeout_ms: u64,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5038,
            username: "admin".to_string(),
            secret: String::new(),
            connect_timeout_ms: 3_000,
            response_timeout_ms: 3_000,
            listing_timeout_ms: 5_000,
        }
    }
}

impl ManagerOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn listing_timeout(&self) -> Duration {
        Duration::from_millis(self.listing_timeout_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CliOptions {
    pub asterisk_binary: PathBuf,
    pub systemctl_binary: PathBuf,
    pub command_timeout_ms: u64,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            asterisk_binary: PathBuf::from("asterisk"),
            systemctl_binary: PathBuf::from("systemctl"),
            command_timeout_ms: 10_000,
        }
    }
}

impl CliOptions {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LogOptions {
    /// Checked in order; the first existing, readable file is tailed.
    pub candidates: Vec<PathBuf>,
    pub poll_interval_ms: u64,
    /// How many bytes from the end of the log `get_recent_errors` scans.
    pub recent_window_bytes: u64,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            candidates: vec![
                PathBuf::from("/var/log/asterisk/full"),
                PathBuf::from("/var/log/asterisk/messages"),
                PathBuf::from("/var/log/asterisk/messages.log"),
            ],
            poll_interval_ms: 100,
            recent_window_bytes: 256 * 1024,
        }
    }
}

impl LogOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ObserverConfig {
    pub ami: ManagerOptions,
    pub cli: CliOptions,
    pub logs: LogOptions,
    /// Dialplan context used by call routing checks.
    pub routing_context: String,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            ami: ManagerOptions::default(),
            cli: CliOptions::default(),
            logs: LogOptions::default(),
            routing_context: "from-internal".to_string(),
        }
    }
}

impl ObserverConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ObserverError> {
        let config: ObserverConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by whichever `AMI_*` / `ASTERISK_*` variables are set.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("AMI_HOST") {
            self.ami.host = host;
        }
        if let Some(port) = lookup("AMI_PORT") {
            match port.parse() {
                Ok(port) => self.ami.port = port,
                Err(_) => log::warn!("Ignoring invalid AMI_PORT value '{port}'"),
            }
        }
        if let Some(username) = lookup("AMI_USERNAME") {
            self.ami.username = username;
        }
        if let Some(secret) = lookup("AMI_PASSWORD") {
            self.ami.secret = secret;
        }
        if let Some(binary) = lookup("ASTERISK_BIN") {
            self.cli.asterisk_binary = PathBuf::from(binary);
        }
        if let Some(path) = lookup("ASTERISK_LOG") {
            self.logs.candidates.insert(0, PathBuf::from(path));
        }
        self
    }

    pub fn validate(&self) -> Result<(), ObserverError> {
        if self.ami.host.trim().is_empty() {
            return Err(ObserverError::Config("ami.host is empty".to_string()));
        }
        if self.ami.connect_timeout_ms == 0 || self.ami.response_timeout_ms == 0 {
            return Err(ObserverError::Config(
                "ami timeouts must be greater than 0ms".to_string(),
            ));
        }
        if self.cli.command_timeout_ms == 0 {
            return Err(ObserverError::Config(
                "cli.command_timeout_ms must be greater than 0ms".to_string(),
            ));
        }
        if self.logs.poll_interval_ms == 0 {
            return Err(ObserverError::Config(
                "logs.poll_interval_ms must be greater than 0ms".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ObserverConfig::default();
        assert_eq!(config.ami.port, 5038);
        assert_eq!(config.ami.listing_timeout(), Duration::from_secs(5));
        assert_eq!(config.logs.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.routing_context, "from-internal");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let config = ObserverConfig::from_json_str(
            r#"{"ami": {"host": "pbx.local", "secret": "s3cret"}, "routing_context": "internal"}"#,
        )
        .unwrap();
        assert_eq!(config.ami.host, "pbx.local");
        assert_eq!(config.ami.secret, "s3cret");
        assert_eq!(config.ami.port, 5038);
        assert_eq!(config.routing_context, "internal");
        assert_eq!(config.cli.asterisk_binary, PathBuf::from("asterisk"));
    }

    #[test]
    fn test_secret_is_not_serialized() {
        let mut config = ObserverConfig::default();
        config.ami.secret = "hunter2".to_string();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn test_invalid_json_config_is_rejected() {
        let result = ObserverConfig::from_json_str(r#"{"logs": {"poll_interval_ms": 0}}"#);
        assert!(matches!(result, Err(ObserverError::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("AMI_HOST", "10.0.0.5"),
            ("AMI_PORT", "not-a-port"),
            ("AMI_USERNAME", "monitor"),
            ("ASTERISK_LOG", "/tmp/asterisk/full"),
        ]
        .into_iter()
        .collect();
        let config =
            ObserverConfig::default().with_overrides(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.ami.host, "10.0.0.5");
        assert_eq!(config.ami.port, 5038);
        assert_eq!(config.ami.username, "monitor");
        assert_eq!(config.logs.candidates[0], PathBuf::from("/tmp/asterisk/full"));
    }
}
