//! Mock implementations for testing
//!
//! A scriptable transport (factory + clients) that raises the same callbacks a
//! real broker connection would, and an in-memory record store with failure
//! injection. Both record every call so tests can assert on ordering.

use crate::identity::{BrokerConfig, ConnectionIdentity};
use crate::ingest::record::MessageRecord;
use crate::store::{RecordSession, RecordStore, StoreError};
use crate::transport::{
    DisconnectReason, QoS, TransportClient, TransportError, TransportEvent,
    TransportEventHandler, TransportFactory,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

pub type PublishedMessage = (String, Vec<u8>);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One observable interaction with a mock client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Connect,
    Disconnect,
    Subscribe(String),
    Unsubscribe(String),
    Publish(String),
    Deliver(String),
    ConnectionLost,
    Reconnect,
}

#[derive(Default)]
struct FactoryState {
    clients: Vec<Weak<MockTransportClient>>,
    created: usize,
    next_connect_failure: Option<TransportError>,
    next_late_connect_failure: Option<TransportError>,
    connect_delay: Duration,
}

/// Factory handing out [`MockTransportClient`]s
#[derive(Default)]
pub struct MockTransportFactory {
    state: Mutex<FactoryState>,
    rejected_filters: Arc<Mutex<HashSet<String>>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next client created fails its `connect` with `error`
    pub fn fail_next_connect(&self, error: TransportError) {
        lock(&self.state).next_connect_failure = Some(error);
    }

    /// The next client raises `Connected`, then fails its `connect` with `error`
    pub fn fail_next_connect_after_ack(&self, error: TransportError) {
        lock(&self.state).next_late_connect_failure = Some(error);
    }

    /// Delay applied to `connect` of clients created from now on
    pub fn set_connect_delay(&self, delay: Duration) {
        lock(&self.state).connect_delay = delay;
    }

    /// Every client, current and future, rejects subscribes to `filter`
    pub fn reject_filter(&self, filter: &str) {
        lock(&self.rejected_filters).insert(filter.to_string());
    }

    pub fn created_count(&self) -> usize {
        lock(&self.state).created
    }

    /// Client instances still alive
    pub fn live_handles(&self) -> usize {
        lock(&self.state)
            .clients
            .iter()
            .filter(|client| client.strong_count() > 0)
            .count()
    }

    /// Most recently created live client for `identity`
    pub fn client_for(&self, identity: &str) -> Option<Arc<MockTransportClient>> {
        lock(&self.state)
            .clients
            .iter()
            .rev()
            .filter_map(Weak::upgrade)
            .find(|client| client.identity.as_str() == identity)
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(
        &self,
        config: &BrokerConfig,
        handler: Arc<dyn TransportEventHandler>,
    ) -> Result<Arc<dyn TransportClient>, TransportError> {
        let mut state = lock(&self.state);
        let client = Arc::new(MockTransportClient {
            identity: config.identity.clone(),
            handler,
            connected: AtomicBool::new(false),
            fail_disconnect: AtomicBool::new(false),
            connect_failure: Mutex::new(state.next_connect_failure.take()),
            late_connect_failure: Mutex::new(state.next_late_connect_failure.take()),
            connect_delay: state.connect_delay,
            rejected_filters: self.rejected_filters.clone(),
            calls: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        });

        state.created += 1;
        state.clients.retain(|client| client.strong_count() > 0);
        state.clients.push(Arc::downgrade(&client));
        Ok(client)
    }
}

/// Client whose network side is driven by the test
pub struct MockTransportClient {
    identity: ConnectionIdentity,
    handler: Arc<dyn TransportEventHandler>,
    connected: AtomicBool,
    fail_disconnect: AtomicBool,
    connect_failure: Mutex<Option<TransportError>>,
    late_connect_failure: Mutex<Option<TransportError>>,
    connect_delay: Duration,
    rejected_filters: Arc<Mutex<HashSet<String>>>,
    calls: Mutex<Vec<MockCall>>,
    published: Mutex<Vec<PublishedMessage>>,
}

impl MockTransportClient {
    fn record(&self, call: MockCall) {
        lock(&self.calls).push(call);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    pub fn subscribe_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Subscribe(filter) => Some(filter),
                _ => None,
            })
            .collect()
    }

    pub fn unsubscribe_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Unsubscribe(filter) => Some(filter),
                _ => None,
            })
            .collect()
    }

    pub fn disconnect_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, MockCall::Disconnect))
            .count()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    pub fn fail_disconnect(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    /// Raise an inbound message the way the transport's I/O task would
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) {
        self.record(MockCall::Deliver(topic.to_string()));
        self.handler.on_message(topic, payload.into());
    }

    /// Network failure
    pub async fn drop_connection(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.record(MockCall::ConnectionLost);
        self.handler
            .on_state_changed(TransportEvent::Disconnected(DisconnectReason::Abnormal(
                reason.to_string(),
            )))
            .await;
    }

    /// Automatic reconnection succeeding
    pub async fn reconnect(&self) {
        self.record(MockCall::Reconnect);
        self.connected.store(true, Ordering::SeqCst);
        self.handler
            .on_state_changed(TransportEvent::Connected {
                session_present: false,
            })
            .await;
    }

    /// Raise an arbitrary state event
    pub async fn emit(&self, event: TransportEvent) {
        self.handler.on_state_changed(event).await;
    }
}

#[async_trait]
impl TransportClient for MockTransportClient {
    async fn connect(&self) -> Result<(), TransportError> {
        self.record(MockCall::Connect);
        let failure = lock(&self.connect_failure).take();
        if let Some(error) = failure {
            return Err(error);
        }
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        self.connected.store(true, Ordering::SeqCst);
        self.handler
            .on_state_changed(TransportEvent::Connected {
                session_present: false,
            })
            .await;

        let late_failure = lock(&self.late_connect_failure).take();
        match late_failure {
            Some(error) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(error)
            }
            None => Ok(()),
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.record(MockCall::Disconnect);
        self.connected.store(false, Ordering::SeqCst);
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(TransportError::DisconnectFailed(
                "mock disconnect failure".to_string(),
            ));
        }
        self.handler
            .on_state_changed(TransportEvent::Disconnected(DisconnectReason::Normal))
            .await;
        Ok(())
    }

    async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<(), TransportError> {
        self.record(MockCall::Subscribe(filter.to_string()));
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        if lock(&self.rejected_filters).contains(filter) {
            return Err(TransportError::SubscribeFailed(format!(
                "broker rejected '{filter}'"
            )));
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.record(MockCall::Unsubscribe(filter.to_string()));
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        _qos: QoS,
        _retain: bool,
    ) -> Result<(), TransportError> {
        self.record(MockCall::Publish(topic.to_string()));
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        lock(&self.published).push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct StoreState {
    records: Vec<MessageRecord>,
    states: HashMap<String, bool>,
    failing_topics: HashSet<String>,
    fail_state_updates: bool,
    fail_commits: bool,
    fail_sessions: bool,
    sessions_opened: usize,
    commits: usize,
    latency: Duration,
}

/// Record store keeping committed records in memory
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `create_record` fails for messages on `topic`
    pub fn fail_topic(&self, topic: &str) {
        lock(&self.state).failing_topics.insert(topic.to_string());
    }

    pub fn fail_state_updates(&self, fail: bool) {
        lock(&self.state).fail_state_updates = fail;
    }

    pub fn fail_commits(&self, fail: bool) {
        lock(&self.state).fail_commits = fail;
    }

    pub fn fail_sessions(&self, fail: bool) {
        lock(&self.state).fail_sessions = fail;
    }

    /// Delay applied to every record and state write
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = latency;
    }

    pub fn records(&self) -> Vec<MessageRecord> {
        lock(&self.state).records.clone()
    }

    /// Topics of committed records, in commit order
    pub fn topics(&self) -> Vec<String> {
        lock(&self.state)
            .records
            .iter()
            .map(|record| record.topic.clone())
            .collect()
    }

    pub fn connection_state(&self, identity: &str) -> Option<bool> {
        lock(&self.state).states.get(identity).copied()
    }

    pub fn sessions_opened(&self) -> usize {
        lock(&self.state).sessions_opened
    }

    /// Successful commits
    pub fn commits(&self) -> usize {
        lock(&self.state).commits
    }

    fn latency(&self) -> Duration {
        lock(&self.state).latency
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn open_session(&self) -> Result<Box<dyn RecordSession>, StoreError> {
        let mut state = lock(&self.state);
        if state.fail_sessions {
            return Err(StoreError::Unavailable("mock store offline".to_string()));
        }
        state.sessions_opened += 1;
        Ok(Box::new(MemorySession {
            store: self.clone(),
            pending: Vec::new(),
        }))
    }

    async fn update_connection_state(
        &self,
        identity: &ConnectionIdentity,
        connected: bool,
    ) -> Result<(), StoreError> {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = lock(&self.state);
        if state.fail_state_updates {
            return Err(StoreError::Unavailable("mock state update failure".to_string()));
        }
        state.states.insert(identity.to_string(), connected);
        Ok(())
    }
}

struct MemorySession {
    store: MemoryRecordStore,
    pending: Vec<MessageRecord>,
}

#[async_trait]
impl RecordSession for MemorySession {
    async fn create_record(&mut self, record: &MessageRecord) -> Result<(), StoreError> {
        let latency = self.store.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if lock(&self.store.state).failing_topics.contains(&record.topic) {
            return Err(StoreError::Rejected(format!(
                "mock rejects topic '{}'",
                record.topic
            )));
        }
        self.pending.push(record.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut state = lock(&self.store.state);
        if state.fail_commits {
            return Err(StoreError::Unavailable("mock commit failure".to_string()));
        }
        state.records.extend(self.pending);
        state.commits += 1;
        Ok(())
    }
}
