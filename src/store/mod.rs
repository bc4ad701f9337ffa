//! Record-store collaborator boundary
//!
//! The pipeline persists through [`RecordStore`]: one [`RecordSession`] is the
//! unit of work for a message (continuous mode) or a batch (batch mode).
//! Durability is the store's business. Connection-state updates go through
//! [`StateUpdater`], which bounds and swallows store failures so they can
//! never stall a transport callback.

use crate::identity::{ConnectionIdentity, InboundMessage};
use crate::ingest::record::MessageRecord;
use crate::observability::metrics::IngestMetrics;
use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub mod jsonl;

pub use jsonl::JsonLinesStore;

/// Errors raised by a record store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Record rejected: {0}")]
    Rejected(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Store operation timed out: {0}")]
    Timeout(String),
}

/// Unit of work against the store
///
/// Dropping a session without `commit` discards whatever it buffered.
#[async_trait]
pub trait RecordSession: Send {
    async fn create_record(&mut self, record: &MessageRecord) -> Result<(), StoreError>;

    /// Make every record created in this session durable
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Persistence collaborator; safe to call from background tasks
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn RecordSession>, StoreError>;

    async fn update_connection_state(
        &self,
        identity: &ConnectionIdentity,
        connected: bool,
    ) -> Result<(), StoreError>;
}

/// Bounded front for the store, shared by connection callbacks and the
/// ingestion processor
///
/// Every store call goes through [`StateUpdater::guarded`]: it is cut off
/// after the store timeout and a panicking store becomes a [`StoreError`].
#[derive(Clone)]
pub struct StateUpdater {
    store: Arc<dyn RecordStore>,
    timeout: Duration,
    metrics: Arc<IngestMetrics>,
}

impl StateUpdater {
    pub fn new(store: Arc<dyn RecordStore>, timeout: Duration, metrics: Arc<IngestMetrics>) -> Self {
        Self {
            store,
            timeout,
            metrics,
        }
    }

    /// Reflect a connection-state transition; failures are logged, never returned
    pub async fn update_connection_state(&self, identity: &ConnectionIdentity, connected: bool) {
        let result = self
            .guarded(self.store.update_connection_state(identity, connected))
            .await;

        match result {
            Ok(()) => {
                debug!(identity = %identity, connected, "Connection state recorded");
            }
            Err(e) => {
                self.metrics.state_update_failed();
                warn!(identity = %identity, connected, error = %e, "Failed to record connection state");
            }
        }
    }

    /// Persist one message in its own session
    pub async fn record_message(&self, message: &InboundMessage) -> Result<(), StoreError> {
        let record = MessageRecord::from_inbound(message);
        self.guarded(async {
            let mut session = self.store.open_session().await?;
            session.create_record(&record).await?;
            session.commit().await
        })
        .await
    }

    /// Open a session for a batch of records
    pub async fn open_session(&self) -> Result<Box<dyn RecordSession>, StoreError> {
        self.guarded(self.store.open_session()).await
    }

    /// Apply the store timeout and turn a panicking store call into an error
    pub async fn guarded<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let guarded = AssertUnwindSafe(work).catch_unwind();
        match tokio::time::timeout(self.timeout, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StoreError::Unavailable("store panicked".to_string())),
            Err(_) => Err(StoreError::Timeout(format!(
                "no response within {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MemoryRecordStore;
    use bytes::Bytes;

    fn id(value: &str) -> ConnectionIdentity {
        ConnectionIdentity::new(value).unwrap()
    }

    #[tokio::test]
    async fn test_state_updater_records_state() {
        let store = Arc::new(MemoryRecordStore::new());
        let metrics = Arc::new(IngestMetrics::new());
        let updater = StateUpdater::new(store.clone(), Duration::from_secs(1), metrics.clone());

        updater.update_connection_state(&id("b1"), true).await;

        assert_eq!(store.connection_state("b1"), Some(true));
        assert_eq!(metrics.snapshot().connections.state_update_failures, 0);
    }

    #[tokio::test]
    async fn test_state_updater_swallows_failures() {
        let store = Arc::new(MemoryRecordStore::new());
        store.fail_state_updates(true);
        let metrics = Arc::new(IngestMetrics::new());
        let updater = StateUpdater::new(store.clone(), Duration::from_secs(1), metrics.clone());

        updater.update_connection_state(&id("b1"), true).await;

        assert_eq!(store.connection_state("b1"), None);
        assert_eq!(metrics.snapshot().connections.state_update_failures, 1);
    }

    #[tokio::test]
    async fn test_state_updater_bounds_slow_store() {
        let store = Arc::new(MemoryRecordStore::new());
        store.set_latency(Duration::from_millis(200));
        let metrics = Arc::new(IngestMetrics::new());
        let updater = StateUpdater::new(store, Duration::from_millis(20), metrics.clone());

        let started = std::time::Instant::now();
        updater.update_connection_state(&id("b1"), false).await;

        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(metrics.snapshot().connections.state_update_failures, 1);
    }

    #[tokio::test]
    async fn test_record_message() {
        let store = Arc::new(MemoryRecordStore::new());
        store.fail_topic("bad/topic");
        let updater = StateUpdater::new(
            store.clone(),
            Duration::from_secs(1),
            Arc::new(IngestMetrics::new()),
        );

        let good = InboundMessage::new(id("b1"), "good/topic", Bytes::from_static(b"1"));
        let bad = InboundMessage::new(id("b1"), "bad/topic", Bytes::from_static(b"2"));

        assert!(updater.record_message(&good).await.is_ok());
        assert!(matches!(
            updater.record_message(&bad).await,
            Err(StoreError::Rejected(_))
        ));
        assert_eq!(store.topics(), vec!["good/topic".to_string()]);
    }

    #[tokio::test]
    async fn test_record_message_bounds_slow_store() {
        let store = Arc::new(MemoryRecordStore::new());
        store.set_latency(Duration::from_millis(200));
        let updater = StateUpdater::new(
            store.clone(),
            Duration::from_millis(20),
            Arc::new(IngestMetrics::new()),
        );

        let message = InboundMessage::new(id("b1"), "slow/topic", Bytes::from_static(b"1"));
        let result = updater.record_message(&message).await;

        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }
}
