//! Service configuration loaded from TOML
//!
//! Broker credentials are never stored here: `[[brokers]]` entries only name
//! the environment variables that hold them, and they are read when the
//! [`BrokerConfig`] for a connect call is built.

use crate::identity::{BrokerConfig, ConnectionIdentity};
use crate::transport::mqtt::connection::{parse_broker_url, ReconnectConfig};
use crate::transport::{qos_from_level, QoS};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main service configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub channel: ChannelSection,
    #[serde(default)]
    pub ingest: IngestSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub brokers: Vec<BrokerEntry>,
}

/// Transport settings shared by every broker connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Bound on the initial connect round-trip (default: 10)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Bound on graceful disconnect before force-release (default: 5)
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout_secs: u64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// QoS used for subscriptions and publishes when none is given (default: 1)
    #[serde(default = "default_qos")]
    pub default_qos: u8,
    /// Capacity of the rumqttc request queue per client
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_disconnect_timeout() -> u64 {
    5
}

fn default_keep_alive() -> u64 {
    60
}

fn default_qos() -> u8 {
    1
}

fn default_request_capacity() -> usize {
    64
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            disconnect_timeout_secs: default_disconnect_timeout(),
            keep_alive_secs: default_keep_alive(),
            default_qos: default_qos(),
            request_capacity: default_request_capacity(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl MqttSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.disconnect_timeout_secs)
    }

    /// Protocol QoS for `default_qos`; out-of-range values fall back to at-least-once
    pub fn qos(&self) -> QoS {
        qos_from_level(self.default_qos).unwrap_or(QoS::AtLeastOnce)
    }
}

/// Message channel capacity policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChannelSection {
    /// Absent = unbounded (no loss, unbounded memory); present = drop when full
    pub capacity: Option<usize>,
}

/// How the ingestion consumer is driven
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// One long-lived consumer task
    #[default]
    Continuous,
    /// Periodic drain of whatever is queued
    Batch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestSection {
    #[serde(default)]
    pub mode: IngestMode,
    /// Interval between drains in batch mode (default: 5)
    #[serde(default = "default_batch_interval")]
    pub batch_interval_secs: u64,
    /// JSON-lines file the binary writes records to
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// Bound on every call into the record store (default: 10)
    #[serde(default = "default_store_timeout")]
    pub store_timeout_secs: u64,
    /// Per-message latency above which a warning is logged (default: 1000)
    #[serde(default = "default_slow_message")]
    pub slow_message_ms: u64,
    /// Time the consumer gets to drain queued messages on shutdown (default: 10)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_batch_interval() -> u64 {
    5
}

fn default_store_path() -> PathBuf {
    PathBuf::from("records.jsonl")
}

fn default_store_timeout() -> u64 {
    10
}

fn default_slow_message() -> u64 {
    1000
}

fn default_shutdown_grace() -> u64 {
    10
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            mode: IngestMode::default(),
            batch_interval_secs: default_batch_interval(),
            store_path: default_store_path(),
            store_timeout_secs: default_store_timeout(),
            slow_message_ms: default_slow_message(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl IngestSection {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn slow_message_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_message_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Health server settings; no port means no server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HealthSection {
    pub port: Option<u16>,
}

/// One broker the binary connects at startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerEntry {
    /// Connection identity
    pub id: String,
    /// `mqtt://host:port` or `mqtts://host:port`; takes precedence over host/port
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub client_id: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default)]
    pub use_tls: bool,
    /// Topic filters subscribed right after connecting
    #[serde(default)]
    pub topics: Vec<String>,
}

impl BrokerEntry {
    /// Build the connect-time config, reading credentials from the environment
    pub fn to_broker_config(&self) -> Result<BrokerConfig, ConfigError> {
        let identity = ConnectionIdentity::new(&self.id)
            .map_err(|_| ConfigError::InvalidBroker(format!("invalid broker id '{}'", self.id)))?;

        let (host, port, use_tls) = match &self.url {
            Some(url) => {
                let address = parse_broker_url(url)
                    .map_err(|e| ConfigError::InvalidBroker(format!("{}: {e}", self.id)))?;
                (address.host, address.port, address.use_tls || self.use_tls)
            }
            None => {
                let host = self.host.clone().ok_or_else(|| {
                    ConfigError::InvalidBroker(format!("broker '{}' needs url or host", self.id))
                })?;
                let port = self
                    .port
                    .unwrap_or(if self.use_tls { 8883 } else { 1883 });
                (host, port, self.use_tls)
            }
        };

        let mut config = BrokerConfig::new(identity, host, port)
            .with_client_id(self.client_id.clone())
            .with_tls(use_tls);

        if let Some(username) = get_env_var_optional(self.username_env.as_ref()) {
            let password = match &self.password_env {
                Some(name) => get_env_var_required(name)?,
                None => String::new(),
            };
            config = config.with_credentials(username, password);
        }

        Ok(config)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid broker: {0}")]
    InvalidBroker(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ServiceConfig {
    /// Load configuration from TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ServiceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency; does not touch the environment
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.connect_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if qos_from_level(self.mqtt.default_qos).is_none() {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.default_qos must be 0, 1 or 2 (got {})",
                self.mqtt.default_qos
            )));
        }
        if self.mqtt.request_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.request_capacity must be greater than 0".to_string(),
            ));
        }
        if let Some(0) = self.mqtt.reconnect.max_attempts {
            return Err(ConfigError::InvalidConfig(
                "mqtt.reconnect.max_attempts must be greater than 0 or omitted".to_string(),
            ));
        }
        if self.mqtt.reconnect.sustained_delay == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.reconnect.sustained_delay_ms must be greater than 0".to_string(),
            ));
        }
        if let Some(0) = self.channel.capacity {
            return Err(ConfigError::InvalidConfig(
                "channel.capacity must be greater than 0 or omitted".to_string(),
            ));
        }
        if self.ingest.mode == IngestMode::Batch && self.ingest.batch_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "ingest.batch_interval_secs must be greater than 0 in batch mode".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for broker in &self.brokers {
            if broker.id.trim().is_empty() {
                return Err(ConfigError::InvalidBroker("broker id is empty".to_string()));
            }
            if !seen.insert(broker.id.as_str()) {
                return Err(ConfigError::InvalidBroker(format!(
                    "duplicate broker id '{}'",
                    broker.id
                )));
            }
            match (&broker.url, &broker.host) {
                (Some(url), _) => {
                    parse_broker_url(url)
                        .map_err(|e| ConfigError::InvalidBroker(format!("{}: {e}", broker.id)))?;
                }
                (None, Some(host)) if !host.trim().is_empty() => {}
                _ => {
                    return Err(ConfigError::InvalidBroker(format!(
                        "broker '{}' needs url or host",
                        broker.id
                    )))
                }
            }
        }

        Ok(())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[mqtt]
connect_timeout_secs = 2

[channel]
capacity = 16

[[brokers]]
id = "b1"
url = "mqtt://localhost:1883"
topics = ["sensors/+/temp"]
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}
