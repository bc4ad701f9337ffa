//! Connection supervisor: one transport client per connection identity
//!
//! The live map and the status table are sharded `DashMap`s, so status reads
//! never wait on a connect or disconnect in flight. Connect and disconnect for
//! the same identity are serialised by a per-identity async mutex; different
//! identities never block each other.
//!
//! Each client gets exactly one [`ConnectionHandler`]. When a client is
//! disposed its handler is retired first, so late callbacks from the old
//! client cannot overwrite the state of a newer client for the same identity.

use super::state::{ConnectionState, ConnectionStatus};
use crate::channel::MessageChannel;
use crate::config::MqttSection;
use crate::error::{sanitize_error_message, IngestError, IngestResult};
use crate::identity::{BrokerConfig, ConnectionIdentity, InboundMessage};
use crate::observability::metrics::IngestMetrics;
use crate::store::StateUpdater;
use crate::transport::{
    DisconnectReason, QoS, TransportClient, TransportEvent, TransportEventHandler,
    TransportFactory,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, instrument, warn};

const NOTIFICATION_CAPACITY: usize = 256;

/// Hook run on every `Connected` transition, before the connection is
/// reported live
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    async fn on_connected(&self, identity: &ConnectionIdentity, client: Arc<dyn TransportClient>);
}

/// State shared between the supervisor and every connection handler
struct Shared {
    channel: Arc<MessageChannel>,
    statuses: DashMap<ConnectionIdentity, ConnectionStatus>,
    observers: RwLock<Vec<Weak<dyn ConnectionObserver>>>,
    notifications: broadcast::Sender<InboundMessage>,
    state_updater: Option<StateUpdater>,
    metrics: Arc<IngestMetrics>,
}

impl Shared {
    fn set_status(&self, identity: &ConnectionIdentity, status: ConnectionStatus) {
        self.statuses.insert(identity.clone(), status);
    }

    fn observers(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        match self.observers.read() {
            Ok(observers) => observers.iter().filter_map(Weak::upgrade).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .filter_map(Weak::upgrade)
                .collect(),
        }
    }

    async fn update_connection_state(&self, identity: &ConnectionIdentity, connected: bool) {
        if let Some(updater) = &self.state_updater {
            updater.update_connection_state(identity, connected).await;
        }
    }
}

/// Transport callbacks for one client instance
struct ConnectionHandler {
    identity: ConnectionIdentity,
    shared: Arc<Shared>,
    live: AtomicBool,
    retired: AtomicBool,
    client: OnceLock<Weak<dyn TransportClient>>,
}

impl ConnectionHandler {
    fn new(identity: ConnectionIdentity, shared: Arc<Shared>) -> Self {
        Self {
            identity,
            shared,
            live: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            client: OnceLock::new(),
        }
    }

    fn bind_client(&self, client: &Arc<dyn TransportClient>) {
        let _ = self.client.set(Arc::downgrade(client));
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        self.live.store(false, Ordering::Release);
    }

    /// Build the message and hand it off without waiting
    fn push_message(&self, topic: &str, payload: Bytes) {
        let message = InboundMessage::new(self.identity.clone(), topic, payload);
        self.shared.metrics.message_received(&self.identity);

        let notification =
            (self.shared.notifications.receiver_count() > 0).then(|| message.clone());

        if self.shared.channel.try_write(message) {
            self.shared.metrics.message_enqueued();
        } else {
            self.shared.metrics.message_dropped();
            warn!(
                identity = %self.identity,
                topic,
                capacity = ?self.shared.channel.capacity(),
                closed = self.shared.channel.is_closed(),
                "Message channel rejected message, dropping it"
            );
        }

        // Best-effort; a lagging subscriber only loses notifications
        if let Some(message) = notification {
            let _ = self.shared.notifications.send(message);
        }
    }

    async fn handle_connected(&self, session_present: bool) {
        debug!(identity = %self.identity, session_present, "Transport connected");

        if let Some(client) = self.client.get().and_then(Weak::upgrade) {
            for observer in self.shared.observers() {
                observer.on_connected(&self.identity, client.clone()).await;
            }
        }

        // Disposed while observers ran
        if self.is_retired() {
            return;
        }

        self.live.store(true, Ordering::Release);
        self.shared
            .set_status(&self.identity, ConnectionStatus::connected());
        self.shared.metrics.connection_established();
        info!(identity = %self.identity, "Connection established");

        self.shared
            .update_connection_state(&self.identity, true)
            .await;
    }

    async fn handle_disconnected(&self, reason: DisconnectReason) {
        self.live.store(false, Ordering::Release);
        self.shared.metrics.connection_lost();

        match reason {
            DisconnectReason::Normal => {
                info!(identity = %self.identity, "Connection closed");
                self.shared
                    .set_status(&self.identity, ConnectionStatus::disconnected());
            }
            DisconnectReason::Abnormal(reason) => {
                let status = ConnectionStatus::error(&reason);
                warn!(
                    identity = %self.identity,
                    reason = status.last_error.as_deref().unwrap_or_default(),
                    "Connection lost"
                );
                self.shared.set_status(&self.identity, status);
            }
        }

        self.shared
            .update_connection_state(&self.identity, false)
            .await;
    }
}

#[async_trait]
impl TransportEventHandler for ConnectionHandler {
    fn on_message(&self, topic: &str, payload: Bytes) {
        if self.is_retired() {
            return;
        }

        let result = catch_unwind(AssertUnwindSafe(|| self.push_message(topic, payload)));
        if result.is_err() {
            error!(
                identity = %self.identity,
                topic,
                "Panic while handling inbound message; message discarded"
            );
        }
    }

    async fn on_state_changed(&self, event: TransportEvent) {
        if self.is_retired() {
            debug!(identity = %self.identity, ?event, "Ignoring event from retired client");
            return;
        }

        match event {
            TransportEvent::Connected { session_present } => {
                self.handle_connected(session_present).await;
            }
            TransportEvent::Disconnected(reason) => {
                self.handle_disconnected(reason).await;
            }
            TransportEvent::Reconnecting { attempt, delay_ms } => {
                self.shared.metrics.reconnect_attempt();
                info!(identity = %self.identity, attempt, delay_ms, "Reconnecting");
            }
            TransportEvent::GaveUp(reason) => {
                self.live.store(false, Ordering::Release);
                let status = ConnectionStatus::error(format!("Reconnection abandoned: {reason}"));
                error!(
                    identity = %self.identity,
                    reason = status.last_error.as_deref().unwrap_or_default(),
                    "Giving up on connection"
                );
                self.shared.set_status(&self.identity, status);
            }
        }
    }
}

struct ConnectionEntry {
    client: Arc<dyn TransportClient>,
    handler: Arc<ConnectionHandler>,
}

/// Owns every live broker connection of the process
pub struct ConnectionSupervisor {
    factory: Arc<dyn TransportFactory>,
    settings: MqttSection,
    entries: DashMap<ConnectionIdentity, Arc<ConnectionEntry>>,
    locks: DashMap<ConnectionIdentity, Arc<Mutex<()>>>,
    shared: Arc<Shared>,
}

impl ConnectionSupervisor {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        channel: Arc<MessageChannel>,
        settings: MqttSection,
        metrics: Arc<IngestMetrics>,
        state_updater: Option<StateUpdater>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            factory,
            settings,
            entries: DashMap::new(),
            locks: DashMap::new(),
            shared: Arc::new(Shared {
                channel,
                statuses: DashMap::new(),
                observers: RwLock::new(Vec::new()),
                notifications,
                state_updater,
                metrics,
            }),
        }
    }

    /// Register a hook for `Connected` transitions; held weakly
    pub fn add_observer(&self, observer: Weak<dyn ConnectionObserver>) {
        match self.shared.observers.write() {
            Ok(mut observers) => observers.push(observer),
            Err(poisoned) => poisoned.into_inner().push(observer),
        }
    }

    /// Copy of every inbound message, best-effort
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<InboundMessage> {
        self.shared.notifications.subscribe()
    }

    pub fn settings(&self) -> &MqttSection {
        &self.settings
    }

    fn identity_lock(&self, identity: &ConnectionIdentity) -> Arc<Mutex<()>> {
        self.locks
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn entry(&self, identity: &str) -> Option<Arc<ConnectionEntry>> {
        self.entries.get(identity).map(|entry| entry.clone())
    }

    /// Connect `config.identity`; `true` once the broker acknowledged the session
    ///
    /// Already-live identities return `true` without touching the client.
    /// Failures leave the identity in `Error` with a sanitised last error and
    /// no entry in the live map.
    #[instrument(skip(self, config), fields(identity = %config.identity))]
    pub async fn connect(&self, config: BrokerConfig) -> bool {
        let identity = config.identity.clone();
        let lock = self.identity_lock(&identity);
        let _guard = lock.lock().await;

        if let Some(existing) = self.entry(identity.as_str()) {
            if existing.handler.is_live() {
                debug!("Already connected");
                return true;
            }
            info!("Replacing stale client");
            self.entries.remove(identity.as_str());
            self.release(&identity, existing).await;
        }

        self.shared.metrics.connection_attempt();
        self.shared
            .set_status(&identity, ConnectionStatus::connecting());

        let handler = Arc::new(ConnectionHandler::new(
            identity.clone(),
            self.shared.clone(),
        ));
        let client = match self.factory.create(&config, handler.clone()) {
            Ok(client) => client,
            Err(e) => {
                self.fail_connect(&identity, &handler, &e.to_string()).await;
                return false;
            }
        };
        handler.bind_client(&client);

        let connect_timeout = self.settings.connect_timeout();
        match tokio::time::timeout(connect_timeout, client.connect()).await {
            Ok(Ok(())) => {
                // Transports report Connected before connect() resolves; cover
                // one that does not.
                if !handler.is_live() {
                    handler.handle_connected(false).await;
                }
                self.entries.insert(
                    identity.clone(),
                    Arc::new(ConnectionEntry { client, handler }),
                );
                true
            }
            Ok(Err(e)) => {
                self.fail_connect(&identity, &handler, &e.to_string()).await;
                false
            }
            Err(_) => {
                self.fail_connect(
                    &identity,
                    &handler,
                    &format!(
                        "Connection timed out after {}s",
                        connect_timeout.as_secs()
                    ),
                )
                .await;
                false
            }
        }
    }

    async fn fail_connect(
        &self,
        identity: &ConnectionIdentity,
        handler: &ConnectionHandler,
        reason: &str,
    ) {
        handler.retire();
        let status = ConnectionStatus::error(reason);
        error!(
            identity = %identity,
            error = status.last_error.as_deref().unwrap_or_default(),
            "Failed to connect"
        );
        self.shared.metrics.connection_failed();
        self.shared.set_status(identity, status);
        // The Connected callback may already have recorded the session
        self.shared.update_connection_state(identity, false).await;
    }

    /// Retire the handler and make a bounded graceful disconnect
    async fn release(&self, identity: &ConnectionIdentity, entry: Arc<ConnectionEntry>) {
        entry.handler.retire();

        let disconnect_timeout = self.settings.disconnect_timeout();
        match tokio::time::timeout(disconnect_timeout, entry.client.disconnect()).await {
            Ok(Ok(())) => debug!(identity = %identity, "Client disconnected"),
            Ok(Err(e)) => warn!(
                identity = %identity,
                error = %sanitize_error_message(&e.to_string()),
                "Graceful disconnect failed, releasing client"
            ),
            Err(_) => warn!(
                identity = %identity,
                timeout_secs = disconnect_timeout.as_secs(),
                "Graceful disconnect timed out, releasing client"
            ),
        }
    }

    /// Disconnect and forget the identity; always ends in `Disconnected`
    ///
    /// The status entry is dropped, so the identity reads as never seen, and
    /// so is its lock unless another connect or disconnect holds it.
    #[instrument(skip(self))]
    pub async fn disconnect(&self, identity: &str) {
        let Some(lock) = self.locks.get(identity).map(|lock| lock.clone()) else {
            debug!("Unknown connection, nothing to disconnect");
            return;
        };

        {
            let _guard = lock.lock().await;
            if let Some((key, entry)) = self.entries.remove(identity) {
                self.release(&key, entry).await;
                info!("Disconnected");
                self.shared.update_connection_state(&key, false).await;
            }
            self.shared.statuses.remove(identity);
        }

        // One reference in the map, one here
        self.locks
            .remove_if(identity, |_, lock| Arc::strong_count(lock) <= 2);
    }

    /// Last known transport liveness
    pub fn is_connected(&self, identity: &str) -> bool {
        self.entries
            .get(identity)
            .map(|entry| entry.handler.is_live())
            .unwrap_or(false)
    }

    /// `Disconnected` with no error for identities never seen
    pub fn status(&self, identity: &str) -> ConnectionStatus {
        self.shared
            .statuses
            .get(identity)
            .map(|status| status.clone())
            .unwrap_or_default()
    }

    /// The live client for `identity`, or why there is none
    pub fn live_client(&self, identity: &str) -> IngestResult<Arc<dyn TransportClient>> {
        let entry = self
            .entry(identity)
            .ok_or_else(|| IngestError::UnknownConnection(identity.to_string()))?;

        if !entry.handler.is_live() {
            return Err(IngestError::NotConnected {
                identity: identity.to_string(),
                state: self.status(identity).state,
            });
        }
        Ok(entry.client.clone())
    }

    /// Publish through the live client; `qos` defaults to the configured level
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub async fn publish(
        &self,
        identity: &str,
        topic: &str,
        payload: Bytes,
        qos: Option<QoS>,
        retain: bool,
    ) -> IngestResult<()> {
        if topic.is_empty() || topic.contains(['+', '#']) {
            return Err(IngestError::invalid_topic_filter(
                topic,
                "publish topics must be non-empty and free of wildcards",
            ));
        }

        let client = self.live_client(identity)?;
        client
            .publish(topic, payload, qos.unwrap_or_else(|| self.settings.qos()), retain)
            .await
            .map_err(|e| IngestError::transport(identity, e))
    }

    /// Every identity with a status entry, sorted
    pub fn connections(&self) -> Vec<(ConnectionIdentity, ConnectionStatus)> {
        let mut connections: Vec<_> = self
            .shared
            .statuses
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        connections.sort_by(|a, b| a.0.cmp(&b.0));
        connections
    }

    /// Identities holding a status entry or a connect/disconnect lock
    pub fn tracked_identities(&self) -> usize {
        let mut identities: BTreeSet<ConnectionIdentity> = self
            .shared
            .statuses
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        identities.extend(self.locks.iter().map(|entry| entry.key().clone()));
        identities.len()
    }

    /// Number of client instances currently held
    pub fn live_count(&self) -> usize {
        self.entries.len()
    }

    pub fn connected_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.handler.is_live())
            .count()
    }

    /// Disconnect everything concurrently, each bounded by the disconnect timeout
    pub async fn shutdown(&self) {
        let identities: Vec<ConnectionIdentity> =
            self.entries.iter().map(|entry| entry.key().clone()).collect();

        info!(connections = identities.len(), "Shutting down connections");
        futures::future::join_all(
            identities
                .iter()
                .map(|identity| self.disconnect(identity.as_str())),
        )
        .await;

        // Anything connected concurrently with shutdown is released without waiting
        self.entries.clear();
    }
}
