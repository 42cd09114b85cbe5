//! Configuration module
//!
//! TOML-based configuration with environment variable overrides
//! (`ROUTEMQ_*` prefix) and `${VAR}` / `${VAR:-default}` substitution
//! inside the file. Everything has a default, so an empty file (or no
//! file) yields a working broker.

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::BrokerConfig;
use crate::protocol::QoS;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static pattern");
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading the config file
    Io(std::io::Error),
    /// Config crate error (parse or merge)
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Session configuration
    pub session: SessionConfig,
    /// QoS handshake configuration
    pub qos: QosConfig,
    /// MQTT feature configuration
    pub mqtt: MqttConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Offline queue bound per persistent session
    pub max_offline_messages: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_offline_messages: 1000,
        }
    }
}

/// QoS handshake configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    /// Retransmission timeout in seconds
    pub retry_interval_secs: u64,
    /// Retransmissions before an exchange is abandoned
    pub max_retry: u32,
    /// Cap on concurrently live outbound packet ids per connection
    pub max_packet_ids: u16,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: 10,
            max_retry: 3,
            max_packet_ids: u16::MAX,
        }
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Granted QoS ceiling (0, 1, or 2)
    pub max_qos: u8,
    /// Whether retained messages are stored and replayed on subscribe
    pub retain_available: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: 2,
            retain_available: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, applying `${VAR}` substitution
    /// and `ROUTEMQ_*` environment overrides
    /// (e.g. `ROUTEMQ_QOS__MAX_RETRY=5`).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);

        let config: Config = config::Config::builder()
            .add_source(File::from_str(&content, FileFormat::Toml))
            .add_source(
                Environment::with_prefix("ROUTEMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(format!(
                "mqtt.max_qos must be 0, 1, or 2 (got {})",
                self.mqtt.max_qos
            )));
        }
        if self.qos.retry_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "qos.retry_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.qos.max_packet_ids == 0 {
            return Err(ConfigError::Validation(
                "qos.max_packet_ids must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Translate into the broker's runtime configuration.
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            retry_interval: Duration::from_secs(self.qos.retry_interval_secs),
            max_retry: self.qos.max_retry,
            max_packet_ids: self.qos.max_packet_ids,
            max_offline_messages: self.session.max_offline_messages,
            max_qos: QoS::from_u8(self.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce),
            retain_available: self.mqtt.retain_available,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.session.max_offline_messages, 1000);
        assert_eq!(config.qos.retry_interval_secs, 10);
        assert_eq!(config.qos.max_retry, 3);
        assert_eq!(config.mqtt.max_qos, 2);
        assert!(config.mqtt.retain_available);
    }

    #[test]
    fn test_parse_toml() {
        let config = Config::from_toml(
            r#"
            [log]
            level = "debug"

            [session]
            max_offline_messages = 50

            [qos]
            retry_interval_secs = 5
            max_retry = 2
            max_packet_ids = 1024

            [mqtt]
            max_qos = 1
            retain_available = false
            "#,
        )
        .unwrap();

        assert_eq!(config.log.level, "debug");
        assert_eq!(config.session.max_offline_messages, 50);
        assert_eq!(config.qos.retry_interval_secs, 5);
        assert_eq!(config.qos.max_packet_ids, 1024);
        assert_eq!(config.mqtt.max_qos, 1);
        assert!(!config.mqtt.retain_available);
    }

    #[test]
    fn test_env_substitution_with_default() {
        std::env::remove_var("ROUTEMQ_TEST_UNSET");
        let config = Config::from_toml(
            r#"
            [log]
            level = "${ROUTEMQ_TEST_UNSET:-trace}"
            "#,
        )
        .unwrap();
        assert_eq!(config.log.level, "trace");
    }

    #[test]
    fn test_invalid_max_qos_rejected() {
        let err = Config::from_toml("[mqtt]\nmax_qos = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_broker_config_mapping() {
        let config = Config::from_toml("[qos]\nretry_interval_secs = 7\n").unwrap();
        let broker = config.broker_config();
        assert_eq!(broker.retry_interval, Duration::from_secs(7));
        assert_eq!(broker.max_qos, QoS::ExactlyOnce);
    }
}
