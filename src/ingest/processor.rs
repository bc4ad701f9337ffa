//! Channel consumer persisting inbound messages through the record store
//!
//! Continuous mode owns the channel for its whole lifetime and opens one
//! session per message. Batch mode empties what is queued when it starts,
//! writes everything through one session and commits it once, however many
//! messages failed along the way.

use super::record::MessageRecord;
use crate::channel::MessageChannel;
use crate::identity::InboundMessage;
use crate::observability::metrics::IngestMetrics;
use crate::store::{RecordSession, RecordStore, StateUpdater, StoreError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one [`IngestionProcessor::drain_batch`] call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Messages taken from the channel
    pub processed: usize,
    /// Messages made durable by the batch commit
    pub persisted: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

pub struct IngestionProcessor {
    channel: Arc<MessageChannel>,
    store: StateUpdater,
    metrics: Arc<IngestMetrics>,
    slow_threshold: Duration,
}

impl IngestionProcessor {
    pub fn new(
        channel: Arc<MessageChannel>,
        store: Arc<dyn RecordStore>,
        metrics: Arc<IngestMetrics>,
        store_timeout: Duration,
        slow_threshold: Duration,
    ) -> Self {
        Self {
            channel,
            store: StateUpdater::new(store, store_timeout, metrics.clone()),
            metrics,
            slow_threshold,
        }
    }

    /// Consume until `cancel` fires or the closed channel is empty
    ///
    /// Returns the number of messages taken from the channel.
    pub async fn run(&self, cancel: CancellationToken) -> u64 {
        info!("Ingestion consumer started");
        let mut processed = 0u64;

        while let Some(message) = self.channel.recv(&cancel).await {
            self.process_message(message).await;
            processed += 1;
        }

        info!(processed, cancelled = cancel.is_cancelled(), "Ingestion consumer stopped");
        processed
    }

    /// Persist one message in its own session; `false` if it was not stored
    pub async fn process_message(&self, message: InboundMessage) -> bool {
        let started = Instant::now();
        let result = self.store.record_message(&message).await;
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                self.metrics.message_persisted(elapsed);
                self.observe_latency(&message, elapsed);
                true
            }
            Err(e) => {
                self.metrics.message_failed(elapsed);
                error!(
                    identity = %message.identity,
                    topic = %message.topic,
                    error = %e,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Failed to persist message"
                );
                false
            }
        }
    }

    /// Empty what is queued right now through a single session
    ///
    /// Messages written while the batch runs are left for the next one.
    pub async fn drain_batch(&self) -> BatchReport {
        let started = Instant::now();
        let pending = self.channel.len();
        if pending == 0 {
            return BatchReport::default();
        }

        let mut session = match self.store.open_session().await {
            Ok(session) => session,
            Err(e) => {
                // Messages stay queued for the next batch
                error!(error = %e, pending, "Failed to open store session for batch");
                return BatchReport {
                    elapsed: started.elapsed(),
                    ..Default::default()
                };
            }
        };

        let mut report = BatchReport::default();
        let mut created = Vec::with_capacity(pending);

        while report.processed < pending {
            let Some(message) = self.channel.try_read() else {
                break;
            };
            report.processed += 1;

            let item_started = Instant::now();
            let record = MessageRecord::from_inbound(&message);
            let result = self.store.guarded(session.create_record(&record)).await;
            let elapsed = item_started.elapsed();

            match result {
                Ok(()) => {
                    self.observe_latency(&message, elapsed);
                    created.push(elapsed);
                }
                Err(e) => {
                    report.failed += 1;
                    self.metrics.message_failed(elapsed);
                    error!(
                        identity = %message.identity,
                        topic = %message.topic,
                        error = %e,
                        "Failed to persist message"
                    );
                }
            }
        }

        match self.commit(session).await {
            Ok(()) => {
                report.persisted = created.len();
                for elapsed in created {
                    self.metrics.message_persisted(elapsed);
                }
            }
            Err(e) => {
                error!(records = created.len(), error = %e, "Failed to commit batch");
                report.failed += created.len();
                for elapsed in created {
                    self.metrics.message_failed(elapsed);
                }
            }
        }

        report.elapsed = started.elapsed();
        self.metrics.batch_drained();
        info!(
            processed = report.processed,
            persisted = report.persisted,
            failed = report.failed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Batch drained"
        );
        report
    }

    async fn commit(&self, session: Box<dyn RecordSession>) -> Result<(), StoreError> {
        self.store.guarded(session.commit()).await
    }

    fn observe_latency(&self, message: &InboundMessage, elapsed: Duration) {
        let elapsed_ms = elapsed.as_millis() as u64;
        if elapsed >= self.slow_threshold {
            self.metrics.slow_message();
            warn!(
                identity = %message.identity,
                topic = %message.topic,
                elapsed_ms,
                threshold_ms = self.slow_threshold.as_millis() as u64,
                "Slow message persistence"
            );
        } else {
            debug!(
                identity = %message.identity,
                topic = %message.topic,
                elapsed_ms,
                "Message persisted"
            );
        }
    }
}
