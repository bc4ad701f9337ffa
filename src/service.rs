//! Caller-facing service: wires the channel, supervisor, registry and
//! consumer together and owns their lifecycle
//!
//! One [`IngestService`] is constructed at process start and shut down once
//! at process end. Controllers call into it; nothing here is global.

use crate::channel::MessageChannel;
use crate::config::{IngestMode, ServiceConfig};
use crate::error::IngestResult;
use crate::identity::{BrokerConfig, InboundMessage};
use crate::ingest::{BatchReport, IngestionProcessor};
use crate::observability::health::{ChannelReport, ConnectionReport, StatusSource};
use crate::observability::metrics::{IngestMetrics, MetricsSnapshot};
use crate::store::{RecordStore, StateUpdater};
use crate::subscriptions::SubscriptionRegistry;
use crate::supervisor::{ConnectionStatus, ConnectionSupervisor};
use crate::transport::{QoS, TransportFactory};
use crate::{ingest_span, mqtt_span};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn, Instrument};

struct Consumer {
    cancel: CancellationToken,
    handle: JoinHandle<u64>,
}

/// The connection supervision and ingestion service
pub struct IngestService {
    config: ServiceConfig,
    channel: Arc<MessageChannel>,
    metrics: Arc<IngestMetrics>,
    supervisor: Arc<ConnectionSupervisor>,
    registry: Arc<SubscriptionRegistry>,
    processor: Arc<IngestionProcessor>,
    consumer: Mutex<Option<Consumer>>,
}

impl IngestService {
    pub fn new(
        config: ServiceConfig,
        factory: Arc<dyn TransportFactory>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let metrics = Arc::new(IngestMetrics::new());
        let channel = Arc::new(MessageChannel::with_capacity(config.channel.capacity));

        let state_updater =
            StateUpdater::new(store.clone(), config.ingest.store_timeout(), metrics.clone());
        let supervisor = Arc::new(ConnectionSupervisor::new(
            factory,
            channel.clone(),
            config.mqtt.clone(),
            metrics.clone(),
            Some(state_updater),
        ));
        let registry = SubscriptionRegistry::new(supervisor.clone(), metrics.clone());
        let processor = Arc::new(IngestionProcessor::new(
            channel.clone(),
            store,
            metrics.clone(),
            config.ingest.store_timeout(),
            config.ingest.slow_message_threshold(),
        ));

        info!(
            channel_capacity = ?config.channel.capacity,
            mode = ?config.ingest.mode,
            "Ingest service created"
        );

        Self {
            config,
            channel,
            metrics,
            supervisor,
            registry,
            processor,
            consumer: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn channel(&self) -> &Arc<MessageChannel> {
        &self.channel
    }

    pub fn metrics(&self) -> &Arc<IngestMetrics> {
        &self.metrics
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    fn consumer_slot(&self) -> std::sync::MutexGuard<'_, Option<Consumer>> {
        self.consumer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn the continuous consumer; `false` if one is already running
    pub fn start_consumer(&self) -> bool {
        let mut slot = self.consumer_slot();
        if slot.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        let processor = self.processor.clone();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            let span = ingest_span!(mode = "continuous");
            async move { processor.run(cancel).instrument(span).await }
        });
        *slot = Some(Consumer { cancel, handle });
        true
    }

    /// Drain whatever is queued now through one store session
    pub async fn drain_batch(&self) -> BatchReport {
        self.processor.drain_batch().await
    }

    /// Drain on a fixed interval until `cancel` fires
    pub async fn run_batches(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.drain_batch()
                        .instrument(ingest_span!(mode = "batch"))
                        .await;
                }
            }
        }
    }

    /// Connect every `[[brokers]]` entry and subscribe its topics
    ///
    /// Returns how many brokers connected. Failures are logged and skipped.
    pub async fn connect_configured(&self) -> usize {
        let mut connected = 0;

        for entry in &self.config.brokers {
            let broker = match entry.to_broker_config() {
                Ok(broker) => broker,
                Err(e) => {
                    error!(identity = %entry.id, error = %e, "Skipping broker");
                    continue;
                }
            };

            let span = mqtt_span!(identity = %entry.id, topics = entry.topics.len());
            let established: bool = async {
                if !self.connect(broker).await {
                    return false;
                }
                for topic in &entry.topics {
                    if let Err(e) = self.subscribe(&entry.id, topic).await {
                        warn!(topic = %topic, error = %e, "Configured subscription failed");
                    }
                }
                true
            }
            .instrument(span)
            .await;

            if established {
                connected += 1;
            }
        }

        info!(
            connected,
            configured = self.config.brokers.len(),
            "Configured brokers connected"
        );
        connected
    }

    pub async fn connect(&self, config: BrokerConfig) -> bool {
        self.supervisor.connect(config).await
    }

    pub async fn disconnect(&self, identity: &str) {
        self.supervisor.disconnect(identity).await
    }

    pub fn is_connected(&self, identity: &str) -> bool {
        self.supervisor.is_connected(identity)
    }

    pub async fn subscribe(&self, identity: &str, filter: &str) -> IngestResult<()> {
        self.registry.subscribe(identity, filter).await
    }

    pub async fn unsubscribe(&self, identity: &str, filter: &str) -> IngestResult<()> {
        self.registry.unsubscribe(identity, filter).await
    }

    pub fn list_subscriptions(&self, identity: &str) -> Vec<String> {
        self.registry.list(identity)
    }

    /// Drop the tracked subscriptions of an identity
    pub fn forget_subscriptions(&self, identity: &str) {
        self.registry.forget(identity)
    }

    pub fn status(&self, identity: &str) -> ConnectionStatus {
        self.supervisor.status(identity)
    }

    /// Publish at the configured default QoS, not retained
    pub async fn publish(
        &self,
        identity: &str,
        topic: &str,
        payload: impl Into<Bytes>,
    ) -> IngestResult<()> {
        self.supervisor
            .publish(identity, topic, payload.into(), None, false)
            .await
    }

    pub async fn publish_with(
        &self,
        identity: &str,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> IngestResult<()> {
        self.supervisor
            .publish(identity, topic, payload.into(), Some(qos), retain)
            .await
    }

    /// Best-effort copy of every inbound message
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<InboundMessage> {
        self.supervisor.subscribe_notifications()
    }

    /// Disconnect everything, then let the consumer drain what is queued
    ///
    /// The consumer gets `ingest.shutdown_grace_secs` before it is cancelled.
    /// Without a running consumer a final batch is drained in place.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("Shutting down ingest service");
        self.supervisor.shutdown().await;
        self.channel.close();

        let consumer = self.consumer_slot().take();
        match consumer {
            Some(Consumer { cancel, mut handle }) => {
                let grace = self.config.ingest.shutdown_grace();
                match tokio::time::timeout(grace, &mut handle).await {
                    Ok(Ok(processed)) => info!(processed, "Consumer drained"),
                    Ok(Err(e)) => error!(error = %e, "Consumer task failed"),
                    Err(_) => {
                        warn!(
                            queued = self.channel.len(),
                            grace_secs = grace.as_secs(),
                            "Consumer did not drain in time, cancelling"
                        );
                        cancel.cancel();
                        if let Err(e) = handle.await {
                            error!(error = %e, "Consumer task failed");
                        }
                    }
                }
            }
            None if self.config.ingest.mode == IngestMode::Batch || !self.channel.is_empty() => {
                let report = self.drain_batch().await;
                info!(processed = report.processed, "Final batch drained");
            }
            None => {}
        }

        info!(
            snapshot = ?self.metrics.snapshot().messages,
            "Ingest service stopped"
        );
    }
}

impl StatusSource for IngestService {
    fn connections(&self) -> Vec<ConnectionReport> {
        self.supervisor
            .connections()
            .into_iter()
            .map(|(identity, status)| ConnectionReport {
                subscriptions: self.registry.list(identity.as_str()),
                messages_received: self.metrics.received_for(identity.as_str()),
                identity: identity.to_string(),
                state: status.state,
                last_error: status.last_error,
            })
            .collect()
    }

    fn channel(&self) -> ChannelReport {
        ChannelReport {
            queued: self.channel.len(),
            capacity: self.channel.capacity(),
            dropped: self.channel.dropped(),
        }
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
