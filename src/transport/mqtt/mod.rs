//! rumqttc-backed transport
//!
//! Pure functions are kept apart from I/O for testability:
//!
//! - [`connection`] - broker options, URL parsing, reconnect policy
//! - [`message_handler`] - pure event routing
//! - [`health_monitor`] - pure reconnection decisions and link-state transitions
//! - [`client`] - impure event loop and protocol calls
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_ingest::config::MqttSection;
//! use mqtt_ingest::transport::mqtt::RumqttTransportFactory;
//! use mqtt_ingest::transport::TransportFactory;
//!
//! let factory = RumqttTransportFactory::new(MqttSection::default());
//! # let _ = factory;
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::{RumqttTransport, RumqttTransportFactory};
pub use connection::{
    configure_mqtt_options, parse_broker_url, BrokerAddress, LinkState, ReconnectConfig,
};
pub use health_monitor::{HealthMonitor, LinkEvent, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
