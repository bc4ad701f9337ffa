//! Observability: structured logging, metrics and the HTTP health server

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{ChannelReport, ConnectionReport, HealthServer, StatusSource};
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{IngestMetrics, MetricsSnapshot};

pub use logging::{ingest_span, lifecycle_span, mqtt_span};
