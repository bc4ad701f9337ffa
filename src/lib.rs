//! MQTT ingest - supervised broker connections with buffered ingestion
//!
//! This crate keeps a dynamic set of MQTT broker connections alive, tracks
//! topic subscriptions per connection, and decouples inbound messages from
//! persistence so a slow or failing store can never stall the transport.
//!
//! # Overview
//!
//! - [`supervisor::ConnectionSupervisor`] owns one transport client per
//!   connection identity and exposes per-connection status
//! - [`subscriptions::SubscriptionRegistry`] tracks filters per identity and
//!   restores them on every reconnect
//! - [`channel::MessageChannel`] sits between transport callbacks and the
//!   consumer, bounded (drop when full) or unbounded
//! - [`ingest::IngestionProcessor`] drains the channel into a
//!   [`store::RecordStore`], isolating failures per message
//! - [`service::IngestService`] wires them together for callers
//!
//! # Quick Start
//!
//! ```rust
//! use mqtt_ingest::config::ServiceConfig;
//! use mqtt_ingest::identity::{BrokerConfig, ConnectionIdentity};
//! use mqtt_ingest::service::IngestService;
//! use mqtt_ingest::testing::{MemoryRecordStore, MockTransportFactory};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let store = Arc::new(MemoryRecordStore::new());
//! let service = IngestService::new(
//!     ServiceConfig::default(),
//!     Arc::new(MockTransportFactory::new()),
//!     store.clone(),
//! );
//!
//! let broker = BrokerConfig::new(ConnectionIdentity::new("b1").unwrap(), "localhost", 1883);
//! assert!(service.connect(broker).await);
//! service.subscribe("b1", "sensors/+/temp").await.unwrap();
//! assert_eq!(service.list_subscriptions("b1"), vec!["sensors/+/temp"]);
//!
//! service.shutdown().await;
//! # });
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod identity;
pub mod ingest;
pub mod observability;
pub mod service;
pub mod store;
pub mod subscriptions;
pub mod supervisor;
pub mod testing;
pub mod transport;

pub use channel::MessageChannel;
pub use config::{ConfigError, ServiceConfig};
pub use error::{IngestError, IngestResult};
pub use identity::{BrokerConfig, ConnectionIdentity, InboundMessage};
pub use service::IngestService;
pub use subscriptions::SubscriptionRegistry;
pub use supervisor::{ConnectionState, ConnectionStatus, ConnectionSupervisor};
pub use transport::mqtt::RumqttTransportFactory;
