//! Server configuration.
//!
//! Layered the usual way: built-in defaults, then an optional TOML file,
//! then `ALERTR_`-prefixed environment variables (`__` separates nesting,
//! e.g. `ALERTR_TIMEOUTS__RECEIVE_SECS=30`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alert_level::{validate_levels, AlertLevel};
use crate::context::SessionSettings;
use crate::error::RuleError;
use crate::executer::ExecuterConfig;
use crate::protocol::ChannelConfig;
use crate::watchdog::WatchdogConfig;

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "ALERTR_";

/// Configuration that cannot be loaded or is unusable.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("invalid alert levels: {0}")]
    Rule(#[from] RuleError),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// Certificate and key of the TLS listener, both PEM.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Connection and transaction timing.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub registration_secs: u64,
    pub receive_secs: u64,
    pub handshake_secs: u64,
    pub poll_ms: u64,
    pub max_backoff_ms: u64,
    pub max_handshake_attempts: u32,
    /// Silence after which the watchdog closes a connection.
    pub connection_timeout_secs: u64,
    pub watchdog_interval_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            registration_secs: 50,
            receive_secs: 50,
            handshake_secs: 20,
            poll_ms: 500,
            max_backoff_ms: 1000,
            max_handshake_attempts: 10,
            connection_timeout_secs: 90,
            watchdog_interval_secs: 5,
        }
    }
}

/// Executer timing.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuterSettings {
    pub sensor_alert_poll_ms: u64,
    pub manager_update_interval_secs: u64,
    pub option_poll_ms: u64,
}

impl Default for ExecuterSettings {
    fn default() -> Self {
        Self {
            sensor_alert_poll_ms: 500,
            manager_update_interval_secs: 60,
            option_poll_ms: 1000,
        }
    }
}

/// Log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub filter: String,
    /// One JSON object per event instead of human-readable lines.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,alertr=debug".to_string(),
            json: false,
        }
    }
}

/// One sensor of the server's own node.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalSensorConfig {
    pub description: String,
    pub alert_levels: Vec<u32>,
}

/// Sensors the server raises alerts for by itself. Unset sensors are not registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InternalSensorsConfig {
    /// Triggered while persistent nodes are disconnected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_timeout: Option<InternalSensorConfig>,
    /// Triggered while sensors stay silent for twice the connection timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_timeout: Option<InternalSensorConfig>,
    /// Interval of the reminders about nodes and sensors that are still timed out.
    pub reminder_secs: u64,
}

impl Default for InternalSensorsConfig {
    fn default() -> Self {
        Self {
            node_timeout: None,
            sensor_timeout: None,
            reminder_secs: 86_400,
        }
    }
}

/// Top-level server configuration.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Without TLS the server accepts plaintext connections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    pub timeouts: TimeoutConfig,
    pub executers: ExecuterSettings,
    pub logging: LoggingConfig,
    pub internal_sensors: InternalSensorsConfig,
    /// Initial value of the `alertSystemActive` option.
    pub alert_system_active: bool,
    pub alert_levels: Vec<AlertLevel>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:44556".to_string(),
            tls: None,
            timeouts: TimeoutConfig::default(),
            executers: ExecuterSettings::default(),
            logging: LoggingConfig::default(),
            internal_sensors: InternalSensorsConfig::default(),
            alert_system_active: true,
            alert_levels: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Checks values that would make the server misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_address.trim().is_empty() {
            return Err(ConfigError::Validation {
                field: "bind_address",
                reason: "must not be empty".to_string(),
            });
        }
        let t = &self.timeouts;
        for (field, value) in [
            ("timeouts.registration_secs", t.registration_secs),
            ("timeouts.receive_secs", t.receive_secs),
            ("timeouts.handshake_secs", t.handshake_secs),
            ("timeouts.poll_ms", t.poll_ms),
            ("timeouts.connection_timeout_secs", t.connection_timeout_secs),
            ("timeouts.watchdog_interval_secs", t.watchdog_interval_secs),
            ("executers.manager_update_interval_secs", self.executers.manager_update_interval_secs),
            ("internal_sensors.reminder_secs", self.internal_sensors.reminder_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if t.max_handshake_attempts == 0 {
            return Err(ConfigError::Validation {
                field: "timeouts.max_handshake_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if t.connection_timeout_secs.saturating_mul(1000) <= t.poll_ms {
            return Err(ConfigError::Validation {
                field: "timeouts.connection_timeout_secs",
                reason: "must exceed the poll interval".to_string(),
            });
        }

        validate_levels(&self.alert_levels)?;
        for level in &self.alert_levels {
            level.validate()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn channel_config(&self) -> ChannelConfig {
        let t = &self.timeouts;
        ChannelConfig {
            poll_timeout: Duration::from_millis(t.poll_ms),
            handshake_timeout: Duration::from_secs(t.handshake_secs),
            receive_timeout: Duration::from_secs(t.receive_secs),
            max_backoff: Duration::from_millis(t.max_backoff_ms),
            max_handshake_attempts: t.max_handshake_attempts,
        }
    }

    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            channel: self.channel_config(),
            registration_timeout: Duration::from_secs(self.timeouts.registration_secs),
        }
    }

    #[must_use]
    pub fn executer_config(&self) -> ExecuterConfig {
        let e = &self.executers;
        ExecuterConfig {
            sensor_alert_poll: Duration::from_millis(e.sensor_alert_poll_ms),
            manager_update_interval_secs: e.manager_update_interval_secs,
            option_poll: Duration::from_millis(e.option_poll_ms),
        }
    }

    #[must_use]
    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            connection_timeout_secs: self.timeouts.connection_timeout_secs,
            check_interval: Duration::from_secs(self.timeouts.watchdog_interval_secs),
            reminder_secs: self.internal_sensors.reminder_secs,
        }
    }
}

/// Builds the layered figment without extracting it.
#[must_use]
pub fn figment(path: Option<&Path>) -> Figment {
    let mut figment = Figment::new().merge(Serialized::defaults(ServerConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Loads and validates the configuration.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let config: ServerConfig = figment(path).extract()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.channel_config(), ChannelConfig::default());
        assert_eq!(config.session_settings().registration_timeout, Duration::from_secs(50));
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alertr.toml");
        fs::write(
            &path,
            r#"
bind_address = "127.0.0.1:9000"

[timeouts]
receive_secs = 10

[tls]
cert_file = "/etc/alertr/server.crt"
key_file = "/etc/alertr/server.key"

[internal_sensors.node_timeout]
description = "node timed out"
alert_levels = [1]

[[alert_levels]]
level = 1
name = "home"
trigger_always = true
"#,
        )
        .unwrap();

        let config: ServerConfig = figment(Some(&path)).extract().unwrap();
        config.validate().unwrap();
        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.timeouts.receive_secs, 10);
        assert_eq!(config.timeouts.handshake_secs, 20);
        assert_eq!(config.tls.unwrap().key_file, PathBuf::from("/etc/alertr/server.key"));
        assert_eq!(config.alert_levels.len(), 1);
        assert!(config.alert_levels[0].trigger_always);
        assert!(config.alert_levels[0].trigger_for_triggered);
        assert_eq!(
            config.internal_sensors.node_timeout.unwrap().alert_levels,
            vec![1]
        );
        assert_eq!(config.internal_sensors.sensor_timeout, None);
        assert_eq!(config.internal_sensors.reminder_secs, 86_400);
    }

    #[test]
    fn test_duplicate_levels_rejected() {
        let mut config = ServerConfig::default();
        config.alert_levels = vec![AlertLevel::new(3, "a"), AlertLevel::new(3, "b")];
        assert!(matches!(config.validate(), Err(ConfigError::Rule(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = ServerConfig::default();
        config.timeouts.receive_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timeouts.receive_secs"));
    }
}
