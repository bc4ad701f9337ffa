//! Transport client capability
//!
//! The supervisor never talks to an MQTT library directly. It asks a
//! [`TransportFactory`] for a [`TransportClient`] and registers exactly one
//! [`TransportEventHandler`] per client at creation time. The rumqttc-backed
//! implementation lives in [`mqtt`]; tests use the scriptable factory in
//! `crate::testing::mocks`.

use crate::identity::BrokerConfig;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

pub mod mqtt;

pub use rumqttc::QoS;

/// Errors raised by a transport client
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Broker rejected connection: {0}")]
    Rejected(String),
    #[error("Operation timed out: {0}")]
    Timeout(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Subscription failed: {0}")]
    SubscribeFailed(String),
    #[error("Unsubscribe failed: {0}")]
    UnsubscribeFailed(String),
    #[error("Publishing failed: {0}")]
    PublishFailed(String),
    #[error("Disconnect failed: {0}")]
    DisconnectFailed(String),
    #[error("Invalid broker address: {0}")]
    InvalidBrokerAddress(String),
    #[error("Client error")]
    Client(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Why a connection went down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Requested by us, or a clean broker-side DISCONNECT
    Normal,
    /// Network failure, protocol error, keep-alive timeout...
    Abnormal(String),
}

/// Connection-state callbacks raised by a transport client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected { session_present: bool },
    Disconnected(DisconnectReason),
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// Reconnection abandoned; the client will not recover on its own
    GaveUp(String),
}

/// Callbacks a transport client raises into the core
///
/// `on_message` runs on the transport's own I/O task and must return
/// promptly. `on_state_changed` calls arrive one at a time in the order the
/// transport raised them, and may issue requests on the client. The client
/// reports itself connected only once the `Connected` callback returned, and
/// holds back inbound messages until then.
#[async_trait]
pub trait TransportEventHandler: Send + Sync {
    fn on_message(&self, topic: &str, payload: Bytes);

    async fn on_state_changed(&self, event: TransportEvent);
}

/// One live client for one broker connection
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Establish the network session; resolves once the broker acknowledged it
    async fn connect(&self) -> Result<(), TransportError>;

    /// Graceful protocol disconnect; also stops the client's I/O task
    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Last known transport liveness
    fn is_connected(&self) -> bool;
}

/// Creates transport clients
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        config: &BrokerConfig,
        handler: Arc<dyn TransportEventHandler>,
    ) -> Result<Arc<dyn TransportClient>, TransportError>;
}

/// Map a numeric QoS level (0, 1, 2) onto the protocol enum
pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_from_level() {
        assert_eq!(qos_from_level(0), Some(QoS::AtMostOnce));
        assert_eq!(qos_from_level(1), Some(QoS::AtLeastOnce));
        assert_eq!(qos_from_level(2), Some(QoS::ExactlyOnce));
        assert_eq!(qos_from_level(3), None);
    }

    #[test]
    fn test_transport_error_display() {
        let errors = vec![
            TransportError::ConnectFailed("refused".to_string()),
            TransportError::Rejected("bad credentials".to_string()),
            TransportError::Timeout("connect".to_string()),
            TransportError::NotConnected,
            TransportError::SubscribeFailed("x".to_string()),
            TransportError::UnsubscribeFailed("x".to_string()),
            TransportError::PublishFailed("x".to_string()),
            TransportError::DisconnectFailed("x".to_string()),
            TransportError::InvalidBrokerAddress("x".to_string()),
            TransportError::Client("boom".to_string().into()),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
