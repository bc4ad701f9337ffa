//! Pure connection configuration for the rumqttc transport
//!
//! This module contains pure functions that turn a [`BrokerConfig`] into
//! rumqttc options, parse broker URLs, and compute reconnection delays.

use crate::config::MqttSection;
use crate::identity::BrokerConfig;
use crate::transport::TransportError;
use rumqttc::{MqttOptions, Transport as RumqttcTransport};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Liveness of one rumqttc event loop as seen by the client task
#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected(String),
    Reconnecting(u32),
    PermanentlyDisconnected(String),
}

/// Reconnection policy applied after an established connection drops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,
    /// Delays for the first attempts, in milliseconds
    #[serde(default = "default_backoff_pattern", rename = "backoff_pattern_ms")]
    pub backoff_pattern: Vec<u64>,
    /// Delay once the pattern is exhausted, in milliseconds
    #[serde(default = "default_sustained_delay", rename = "sustained_delay_ms")]
    pub sustained_delay: u64,
}

fn default_max_attempts() -> Option<u32> {
    Some(10)
}

fn default_backoff_pattern() -> Vec<u64> {
    vec![500, 1000, 2000]
}

fn default_sustained_delay() -> u64 {
    5000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_pattern: default_backoff_pattern(),
            sustained_delay: default_sustained_delay(),
        }
    }
}

impl ReconnectConfig {
    /// Calculate backoff delay for the given 1-based attempt
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    /// Total time spent sleeping before giving up; None if unlimited
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }
}

/// Host, port and TLS flag extracted from a broker URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse `mqtt://host[:port]` / `mqtts://host[:port]` (also `tcp`, `ssl`)
pub fn parse_broker_url(broker_url: &str) -> Result<BrokerAddress, TransportError> {
    let url = Url::parse(broker_url)
        .map_err(|_| TransportError::InvalidBrokerAddress(broker_url.to_string()))?;

    let use_tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(TransportError::InvalidBrokerAddress(broker_url.to_string())),
    };

    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| TransportError::InvalidBrokerAddress(broker_url.to_string()))?;
    let port = url.port().unwrap_or(if use_tls { 8883 } else { 1883 });

    Ok(BrokerAddress {
        host: host.to_string(),
        port,
        use_tls,
    })
}

/// Build rumqttc options for one broker connection
pub fn configure_mqtt_options(
    config: &BrokerConfig,
    settings: &MqttSection,
) -> Result<MqttOptions, TransportError> {
    if config.host.trim().is_empty() {
        return Err(TransportError::InvalidBrokerAddress(format!(
            "empty host for connection '{}'",
            config.identity
        )));
    }
    if config.port == 0 {
        return Err(TransportError::InvalidBrokerAddress(format!(
            "port 0 for connection '{}'",
            config.identity
        )));
    }

    let mut mqtt_options =
        MqttOptions::new(config.effective_client_id(), config.host.clone(), config.port);

    if config.use_tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username) = &config.username {
        let password = config.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username.clone(), password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs.max(5)));

    // The broker discards our session on disconnect; subscriptions are
    // restored by the registry after every ConnAck instead.
    mqtt_options.set_clean_session(true);

    mqtt_options.set_max_packet_size(256 * 1024, 256 * 1024);

    Ok(mqtt_options)
}
