//! Impure I/O operations for the rumqttc transport
//!
//! One [`RumqttTransport`] wraps one `AsyncClient` and drives its `EventLoop`
//! in a spawned task. State callbacks are delivered in order on a second
//! task, so the loop keeps polling while a `Connected` callback restores
//! subscriptions. The link only reports `Connected` once that callback has
//! returned; inbound messages arriving meanwhile are held back until then.
//!
//! Subscribe and unsubscribe resolve on the broker's SUBACK or UNSUBACK.
//! Waiters are queued in request order and keyed by packet id once rumqttc
//! writes the packet.

use super::connection::{configure_mqtt_options, LinkState, ReconnectConfig};
use super::health_monitor::{HealthMonitor, LinkEvent, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::MqttSection;
use crate::identity::{BrokerConfig, ConnectionIdentity};
use crate::transport::{
    DisconnectReason, QoS, TransportClient, TransportError, TransportEvent,
    TransportEventHandler, TransportFactory,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ClientError, EventLoop};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pause before retrying a request the full rumqttc queue refused
const REQUEST_RETRY_INTERVAL: Duration = Duration::from_millis(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckKind {
    Subscribe,
    Unsubscribe,
}

impl AckKind {
    fn error(self, reason: String) -> TransportError {
        match self {
            AckKind::Subscribe => TransportError::SubscribeFailed(reason),
            AckKind::Unsubscribe => TransportError::UnsubscribeFailed(reason),
        }
    }
}

type AckResult = Result<(), TransportError>;

/// A subscribe or unsubscribe waiting for the broker's answer
struct AckWaiter {
    kind: AckKind,
    filter: String,
    reply: oneshot::Sender<AckResult>,
}

impl AckWaiter {
    fn succeed(self) {
        let _ = self.reply.send(Ok(()));
    }

    fn fail(self, reason: impl Into<String>) {
        let error = self.kind.error(reason.into());
        let _ = self.reply.send(Err(error));
    }
}

/// Waiters for SUBACK and UNSUBACK
///
/// A waiter sits in its queue until rumqttc writes the packet and reports the
/// packet id, then moves to `sent` until the broker answers.
#[derive(Default)]
struct PendingAcks {
    subscribes: VecDeque<AckWaiter>,
    unsubscribes: VecDeque<AckWaiter>,
    sent: HashMap<u16, AckWaiter>,
}

impl PendingAcks {
    fn queued(&mut self, kind: AckKind) -> &mut VecDeque<AckWaiter> {
        match kind {
            AckKind::Subscribe => &mut self.subscribes,
            AckKind::Unsubscribe => &mut self.unsubscribes,
        }
    }

    /// Bind the oldest queued waiter of `kind` to `packet_id`
    fn mark_sent(&mut self, kind: AckKind, packet_id: u16) -> Option<&str> {
        let waiter = self.queued(kind).pop_front()?;
        if let Some(stale) = self.sent.insert(packet_id, waiter) {
            stale.fail("packet id reused before acknowledgement");
        }
        self.sent.get(&packet_id).map(|waiter| waiter.filter.as_str())
    }

    fn take_sent(&mut self, packet_id: u16) -> Option<AckWaiter> {
        self.sent.remove(&packet_id)
    }

    /// Fail waiters whose packet went out on a session that is gone
    ///
    /// Queued waiters stay: their requests are still in the rumqttc channel
    /// and go out on the next session.
    fn fail_sent(&mut self, reason: &str) {
        for (_, waiter) in self.sent.drain() {
            waiter.fail(reason);
        }
    }

    fn fail_all(&mut self, reason: &str) {
        self.fail_sent(reason);
        for waiter in self.subscribes.drain(..).chain(self.unsubscribes.drain(..)) {
            waiter.fail(reason);
        }
    }
}

/// One state callback for the delivery task
struct Callback {
    event: TransportEvent,
    done: Option<oneshot::Sender<()>>,
}

/// Run state callbacks one at a time, in the order the event loop raised them
async fn deliver_callbacks(
    handler: Arc<dyn TransportEventHandler>,
    mut callbacks: mpsc::UnboundedReceiver<Callback>,
) {
    while let Some(Callback { event, done }) = callbacks.recv().await {
        handler.on_state_changed(event).await;
        if let Some(done) = done {
            let _ = done.send(());
        }
    }
}

/// rumqttc-backed transport client for one broker connection
pub struct RumqttTransport {
    identity: ConnectionIdentity,
    client: AsyncClient,
    event_loop: Mutex<Option<EventLoop>>,
    handler: Arc<dyn TransportEventHandler>,
    settings: MqttSection,
    state_tx: watch::Sender<LinkState>,
    shutdown_tx: watch::Sender<bool>,
    acks: Arc<Mutex<PendingAcks>>,
    // Held while queueing so waiter order matches request order
    request_order: tokio::sync::Mutex<()>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttTransport {
    pub fn new(
        config: &BrokerConfig,
        settings: &MqttSection,
        handler: Arc<dyn TransportEventHandler>,
    ) -> Result<Self, TransportError> {
        let mqtt_options = configure_mqtt_options(config, settings)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, settings.request_capacity);
        let ((state_tx, _), (shutdown_tx, _)) = Self::setup_connection_channels();

        Ok(Self {
            identity: config.identity.clone(),
            client,
            event_loop: Mutex::new(Some(event_loop)),
            handler,
            settings: settings.clone(),
            state_tx,
            shutdown_tx,
            acks: Arc::new(Mutex::new(PendingAcks::default())),
            request_order: tokio::sync::Mutex::new(()),
            event_loop_handle: Mutex::new(None),
        })
    }

    /// Create link state and shutdown channels
    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (watch::Sender<LinkState>, watch::Receiver<LinkState>),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        let state_channels = watch::channel(LinkState::Connecting);
        let shutdown_channels = watch::channel(false);
        (state_channels, shutdown_channels)
    }

    /// Wait for the first ConnAck with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<LinkState>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    LinkState::Connected => return Ok(()),
                    LinkState::Disconnected(reason) => {
                        return Err(TransportError::ConnectFailed(reason.clone()));
                    }
                    LinkState::PermanentlyDisconnected(reason) => {
                        return Err(TransportError::ConnectFailed(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    LinkState::Connecting | LinkState::Reconnecting(_) => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(TransportError::ConnectFailed(
                        "State channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(format!(
                "no ConnAck within {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Perform interruptible sleep with shutdown monitoring
    /// Returns true if sleep completed, false if shutdown requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    fn ensure_accepts_requests(&self) -> Result<(), TransportError> {
        if lock(&self.event_loop_handle).is_none() {
            return Err(TransportError::NotConnected);
        }
        if !HealthMonitor::accepts_requests(&self.state_tx.borrow()) {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    fn event_loop_stopped(&self) -> bool {
        lock(&self.event_loop_handle)
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }

    fn stop_event_loop(&self) {
        self.shutdown_tx.send_replace(true);
        if let Some(handle) = lock(&self.event_loop_handle).take() {
            handle.abort();
        }
        lock(&self.acks).fail_all("client stopped");
    }

    async fn bounded<F, T>(&self, what: &str, request: F) -> Result<T, TransportError>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::time::timeout(self.settings.connect_timeout(), request)
            .await
            .map_err(|_| TransportError::Timeout(what.to_string()))
    }

    /// Queue a subscribe or unsubscribe and wait for the broker's answer
    async fn acknowledged(&self, kind: AckKind, filter: &str, qos: QoS) -> AckResult {
        let reply = self.enqueue(kind, filter, qos).await?;
        match reply.await {
            Ok(result) => result,
            Err(_) => Err(kind.error(
                "client stopped before acknowledgement".to_string(),
            )),
        }
    }

    async fn enqueue(
        &self,
        kind: AckKind,
        filter: &str,
        qos: QoS,
    ) -> Result<oneshot::Receiver<AckResult>, TransportError> {
        let _order = self.request_order.lock().await;

        loop {
            let (reply, receiver) = oneshot::channel();
            let queued = {
                let mut acks = lock(&self.acks);
                acks.queued(kind).push_back(AckWaiter {
                    kind,
                    filter: filter.to_string(),
                    reply,
                });
                let request = match kind {
                    AckKind::Subscribe => self.client.try_subscribe(filter, qos),
                    AckKind::Unsubscribe => self.client.try_unsubscribe(filter),
                };
                if request.is_err() {
                    acks.queued(kind).pop_back();
                }
                request
            };

            match queued {
                Ok(()) => return Ok(receiver),
                Err(ClientError::TryRequest(_)) if !self.event_loop_stopped() => {
                    tokio::time::sleep(REQUEST_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(kind.error(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl TransportClient for RumqttTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let event_loop = lock(&self.event_loop)
            .take()
            .ok_or_else(|| TransportError::ConnectFailed("Event loop already started".to_string()))?;

        let (callbacks, callback_rx) = mpsc::unbounded_channel();
        tokio::spawn(deliver_callbacks(self.handler.clone(), callback_rx));

        let state_rx = self.state_tx.subscribe();
        let task = EventLoopTask {
            identity: self.identity.clone(),
            handler: self.handler.clone(),
            reconnect: self.settings.reconnect.clone(),
            state_tx: self.state_tx.clone(),
            acks: self.acks.clone(),
            callbacks,
            restoring: None,
            held_messages: VecDeque::new(),
            established: false,
            reconnect_attempts: 0,
        };
        let handle = tokio::spawn(task.run(event_loop, self.shutdown_tx.subscribe()));
        *lock(&self.event_loop_handle) = Some(handle);

        let result =
            Self::wait_for_connection_confirmation(state_rx, self.settings.connect_timeout()).await;
        if result.is_err() {
            self.stop_event_loop();
        }
        result
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(handle) = lock(&self.event_loop_handle).take() else {
            return Ok(());
        };
        let abort = handle.abort_handle();

        let result = match self.bounded("disconnect", self.client.disconnect()).await {
            Ok(Ok(())) => {
                match tokio::time::timeout(self.settings.disconnect_timeout(), handle).await {
                    Ok(_) => Ok(()),
                    Err(_) => Err(TransportError::Timeout(
                        "event loop did not stop after disconnect".to_string(),
                    )),
                }
            }
            Ok(Err(e)) => Err(TransportError::DisconnectFailed(e.to_string())),
            Err(e) => Err(e),
        };

        self.shutdown_tx.send_replace(true);
        abort.abort();
        lock(&self.acks).fail_all("client disconnected");
        result
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.ensure_accepts_requests()?;

        self.bounded("subscribe", self.acknowledged(AckKind::Subscribe, filter, qos))
            .await?
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.ensure_accepts_requests()?;

        self.bounded(
            "unsubscribe",
            self.acknowledged(AckKind::Unsubscribe, filter, QoS::AtMostOnce),
        )
        .await?
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.ensure_accepts_requests()?;

        self.bounded("publish", self.client.publish_bytes(topic, qos, retain, payload))
            .await?
            .map_err(|e| TransportError::PublishFailed(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        matches!(*self.state_tx.borrow(), LinkState::Connected)
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        // Callers should disconnect() for a graceful shutdown; this only
        // makes sure the event loop task does not outlive the client.
        self.stop_event_loop();
    }
}

/// Resolves once the tracked callback returned; never without one
async fn callback_done(pending: &mut Option<oneshot::Receiver<()>>) {
    match pending {
        Some(done) => {
            let _ = done.await;
        }
        None => std::future::pending().await,
    }
}

/// State owned by the spawned event loop task
struct EventLoopTask {
    identity: ConnectionIdentity,
    handler: Arc<dyn TransportEventHandler>,
    reconnect: ReconnectConfig,
    state_tx: watch::Sender<LinkState>,
    acks: Arc<Mutex<PendingAcks>>,
    callbacks: mpsc::UnboundedSender<Callback>,
    // Set while the Connected callback of the current session runs
    restoring: Option<oneshot::Receiver<()>>,
    held_messages: VecDeque<(String, Bytes)>,
    established: bool,
    reconnect_attempts: u32,
}

impl EventLoopTask {
    async fn run(mut self, mut event_loop: EventLoop, mut shutdown_rx: watch::Receiver<bool>) {
        info!(identity = %self.identity, "Starting MQTT event loop");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            // The poll future is never dropped mid-flight except on shutdown;
            // rumqttc may be halfway through a write.
            let polled = {
                let poll = event_loop.poll();
                tokio::pin!(poll);
                loop {
                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break None;
                            }
                        }
                        () = callback_done(&mut self.restoring) => self.finish_restore(),
                        event_result = &mut poll => break Some(event_result),
                    }
                }
            };

            let keep_running = match polled {
                None => false,
                Some(Ok(event)) => {
                    let route = MessageHandler::route_mqtt_event(&event);
                    self.process_event_route(route, &shutdown_rx).await
                }
                Some(Err(e)) => {
                    self.handle_connection_lost(
                        LinkEvent::NetworkError(e.to_string()),
                        DisconnectReason::Abnormal(e.to_string()),
                        &shutdown_rx,
                    )
                    .await
                }
            };

            if !keep_running {
                break;
            }
        }

        if matches!(*self.state_tx.borrow(), LinkState::Connected) {
            self.transition(LinkEvent::ClientDisconnected);
        }
        self.release_held_messages();
        lock(&self.acks).fail_all("event loop stopped");
        info!(identity = %self.identity, "MQTT event loop stopped");
    }

    /// Process routed MQTT event
    /// Returns true to continue loop, false to break
    async fn process_event_route(
        &mut self,
        route: EventRoute,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged { session_present } => {
                self.reconnect_attempts = 0;
                self.established = true;
                lock(&self.acks).fail_sent("session replaced before acknowledgement");
                // Observers restore subscriptions from this callback while
                // the loop keeps polling for their acknowledgements.
                self.restoring =
                    Some(self.notify_tracked(TransportEvent::Connected { session_present }));
                true
            }
            EventRoute::ConnectionRefused(code) => {
                let reason = format!("Connection refused: {code}");
                self.handle_connection_lost(
                    LinkEvent::NetworkError(reason.clone()),
                    DisconnectReason::Abnormal(reason),
                    shutdown_rx,
                )
                .await
            }
            EventRoute::MessageReceived { topic, payload } => {
                if self.restoring.is_some() {
                    self.held_messages.push_back((topic, payload));
                } else {
                    self.handler.on_message(&topic, payload);
                }
                true
            }
            EventRoute::Disconnected => {
                self.handle_connection_lost(
                    LinkEvent::DisconnectedByBroker,
                    DisconnectReason::Normal,
                    shutdown_rx,
                )
                .await
            }
            EventRoute::DisconnectSent => {
                self.transition(LinkEvent::ClientDisconnected);
                self.notify(TransportEvent::Disconnected(DisconnectReason::Normal));
                false
            }
            EventRoute::SubscribeSent { packet_id } => {
                self.mark_sent(AckKind::Subscribe, packet_id);
                true
            }
            EventRoute::UnsubscribeSent { packet_id } => {
                self.mark_sent(AckKind::Unsubscribe, packet_id);
                true
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                rejected,
            } => {
                let waiter = lock(&self.acks).take_sent(packet_id);
                match waiter {
                    Some(waiter) if rejected > 0 => {
                        warn!(
                            identity = %self.identity,
                            filter = %waiter.filter,
                            packet_id,
                            "Broker rejected subscription"
                        );
                        let reason = format!("broker rejected '{}'", waiter.filter);
                        waiter.fail(reason);
                    }
                    Some(waiter) => {
                        debug!(target: "mqtt_transport", identity = %self.identity, filter = %waiter.filter, "Subscription confirmed");
                        waiter.succeed();
                    }
                    None => {
                        debug!(target: "mqtt_transport", identity = %self.identity, packet_id, "SubAck without a waiter");
                    }
                }
                true
            }
            EventRoute::UnsubscribeConfirmed { packet_id } => {
                if let Some(waiter) = lock(&self.acks).take_sent(packet_id) {
                    debug!(target: "mqtt_transport", identity = %self.identity, filter = %waiter.filter, "Unsubscribe confirmed");
                    waiter.succeed();
                }
                true
            }
            EventRoute::InfrastructureEvent(event_str) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    fn mark_sent(&self, kind: AckKind, packet_id: u16) {
        let mut acks = lock(&self.acks);
        match acks.mark_sent(kind, packet_id) {
            Some(filter) => {
                debug!(target: "mqtt_transport", identity = %self.identity, filter, packet_id, ?kind, "Awaiting acknowledgement");
            }
            None => {
                debug!(target: "mqtt_transport", identity = %self.identity, packet_id, ?kind, "Request sent without a waiter");
            }
        }
    }

    /// The Connected callback returned: report the link live
    fn finish_restore(&mut self) {
        self.restoring = None;
        self.transition(LinkEvent::ConnAckReceived);
        self.release_held_messages();
    }

    fn notify(&self, event: TransportEvent) {
        let _ = self.callbacks.send(Callback { event, done: None });
    }

    /// Queue a callback and get a receiver that fires once it returned
    fn notify_tracked(&self, event: TransportEvent) -> oneshot::Receiver<()> {
        let (done, receiver) = oneshot::channel();
        // A closed delivery task drops `done`, which also resolves the receiver
        let _ = self.callbacks.send(Callback {
            event,
            done: Some(done),
        });
        receiver
    }

    fn release_held_messages(&mut self) {
        for (topic, payload) in self.held_messages.drain(..) {
            self.handler.on_message(&topic, payload);
        }
    }

    /// Report a dropped link and decide whether to keep polling
    async fn handle_connection_lost(
        &mut self,
        event: LinkEvent,
        reason: DisconnectReason,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> bool {
        self.transition(event);
        self.restoring = None;
        self.release_held_messages();
        lock(&self.acks).fail_sent("connection lost before acknowledgement");

        // A failure before the first ConnAck fails connect() outright
        if !self.established {
            return false;
        }

        self.notify(TransportEvent::Disconnected(reason));
        self.attempt_reconnection(shutdown_rx).await
    }

    async fn attempt_reconnection(&mut self, shutdown_rx: &watch::Receiver<bool>) -> bool {
        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.reconnect,
            *shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.reconnect_attempts = attempt;
                self.transition(LinkEvent::ReconnectionStarted(attempt));
                self.notify(TransportEvent::Reconnecting { attempt, delay_ms });

                let max_display = self
                    .reconnect
                    .max_attempts
                    .map_or("unlimited".to_string(), |max| max.to_string());
                info!(
                    identity = %self.identity,
                    "Attempting reconnection {}/{} after {}ms delay",
                    attempt, max_display, delay_ms
                );

                // rumqttc reconnects on the next poll
                RumqttTransport::interruptible_sleep(shutdown_rx.clone(), delay_ms).await
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!(identity = %self.identity, "Shutdown signal received, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "Max reconnection attempts ({}) exceeded",
                    self.reconnect_attempts
                );
                self.transition(LinkEvent::PermanentFailure(reason.clone()));
                self.notify(TransportEvent::GaveUp(reason));
                false
            }
        }
    }

    fn transition(&self, event: LinkEvent) {
        let next = HealthMonitor::determine_next_state(event);
        let previous = self.state_tx.send_replace(next.clone());
        HealthMonitor::log_state_transition(self.identity.as_str(), &previous, &next);
    }
}

/// Builds one [`RumqttTransport`] per connect call
#[derive(Debug, Clone, Default)]
pub struct RumqttTransportFactory {
    settings: MqttSection,
}

impl RumqttTransportFactory {
    pub fn new(settings: MqttSection) -> Self {
        Self { settings }
    }
}

impl TransportFactory for RumqttTransportFactory {
    fn create(
        &self,
        config: &BrokerConfig,
        handler: Arc<dyn TransportEventHandler>,
    ) -> Result<Arc<dyn TransportClient>, TransportError> {
        let transport = RumqttTransport::new(config, &self.settings, handler)?;
        Ok(Arc::new(transport))
    }
}
