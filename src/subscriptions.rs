//! Per-connection topic subscription tracking
//!
//! The registry remembers every filter subscribed through it, keyed by
//! connection identity. Tracked filters survive `Disconnect` and are
//! re-issued on every `Connected` transition of the identity, before the
//! supervisor reports the connection live. Use [`SubscriptionRegistry::forget`]
//! to drop an identity's set explicitly.

use crate::error::{sanitize_error_message, IngestError, IngestResult};
use crate::identity::ConnectionIdentity;
use crate::observability::metrics::IngestMetrics;
use crate::supervisor::{ConnectionObserver, ConnectionSupervisor};
use crate::transport::{QoS, TransportClient};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Longest topic filter MQTT can encode
const MAX_FILTER_LEN: usize = 65_535;

/// Check MQTT topic filter syntax
///
/// `+` and `#` must occupy a whole level and `#` must be the last level.
pub fn validate_topic_filter(filter: &str) -> IngestResult<()> {
    if filter.is_empty() {
        return Err(IngestError::invalid_topic_filter(filter, "filter is empty"));
    }
    if filter.len() > MAX_FILTER_LEN {
        return Err(IngestError::invalid_topic_filter(
            filter.chars().take(64).collect::<String>(),
            format!("filter longer than {MAX_FILTER_LEN} bytes"),
        ));
    }
    if filter.contains('\0') {
        return Err(IngestError::invalid_topic_filter(
            filter,
            "filter contains a NUL character",
        ));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != last) {
            return Err(IngestError::invalid_topic_filter(
                filter,
                "'#' must be a whole level and the last one",
            ));
        }
        if level.contains('+') && *level != "+" {
            return Err(IngestError::invalid_topic_filter(
                filter,
                "'+' must occupy a whole level",
            ));
        }
    }
    Ok(())
}

/// Outcome of re-issuing an identity's tracked filters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    /// Filter and sanitised reason
    pub failed: Vec<(String, String)>,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Tracks topic filters per connection identity
pub struct SubscriptionRegistry {
    supervisor: Arc<ConnectionSupervisor>,
    subscriptions: DashMap<ConnectionIdentity, BTreeMap<String, QoS>>,
    metrics: Arc<IngestMetrics>,
}

impl SubscriptionRegistry {
    /// Create a registry and register it for `Connected` transitions
    pub fn new(supervisor: Arc<ConnectionSupervisor>, metrics: Arc<IngestMetrics>) -> Arc<Self> {
        let registry = Arc::new(Self {
            supervisor: supervisor.clone(),
            subscriptions: DashMap::new(),
            metrics,
        });

        let observer: Arc<dyn ConnectionObserver> = registry.clone();
        supervisor.add_observer(Arc::downgrade(&observer));
        registry
    }

    /// Subscribe at the configured default QoS
    pub async fn subscribe(&self, identity: &str, filter: &str) -> IngestResult<()> {
        let qos = self.supervisor.settings().qos();
        self.subscribe_with_qos(identity, filter, qos).await
    }

    /// Issue the protocol subscribe, then track the filter
    ///
    /// Re-subscribing a tracked filter re-issues the protocol call but keeps a
    /// single entry.
    #[instrument(skip(self))]
    pub async fn subscribe_with_qos(
        &self,
        identity: &str,
        filter: &str,
        qos: QoS,
    ) -> IngestResult<()> {
        validate_topic_filter(filter)?;
        let client = self.supervisor.live_client(identity)?;
        let key = ConnectionIdentity::new(identity)?;

        client
            .subscribe(filter, qos)
            .await
            .map_err(|e| IngestError::transport(identity, e))?;

        let previous = self
            .subscriptions
            .entry(key)
            .or_default()
            .insert(filter.to_string(), qos);
        if previous.is_none() {
            info!("Subscribed");
        } else {
            debug!("Re-subscribed tracked filter");
        }
        Ok(())
    }

    /// Remove a tracked filter; unknown filters are a no-op
    ///
    /// Without a live client the filter is only dropped from tracking.
    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, identity: &str, filter: &str) -> IngestResult<()> {
        if !self.is_tracked(identity, filter) {
            debug!("Filter not tracked, nothing to unsubscribe");
            return Ok(());
        }

        match self.supervisor.live_client(identity) {
            Ok(client) => {
                client
                    .unsubscribe(filter)
                    .await
                    .map_err(|e| IngestError::transport(identity, e))?;
                info!("Unsubscribed");
            }
            Err(e) if e.is_not_connected() => {
                info!("No live client, removing filter from tracking only");
            }
            Err(e) => return Err(e),
        }

        self.remove(identity, filter);
        Ok(())
    }

    fn is_tracked(&self, identity: &str, filter: &str) -> bool {
        self.subscriptions
            .get(identity)
            .map(|filters| filters.contains_key(filter))
            .unwrap_or(false)
    }

    fn remove(&self, identity: &str, filter: &str) {
        if let Some(mut filters) = self.subscriptions.get_mut(identity) {
            filters.remove(filter);
        }
        self.subscriptions
            .remove_if(identity, |_, filters| filters.is_empty());
    }

    /// Tracked filters, sorted; empty for unknown identities
    pub fn list(&self, identity: &str) -> Vec<String> {
        self.subscriptions
            .get(identity)
            .map(|filters| filters.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every tracked filter of `identity` without any protocol call
    pub fn forget(&self, identity: &str) {
        if self.subscriptions.remove(identity).is_some() {
            info!(identity, "Forgot tracked subscriptions");
        }
    }

    /// Re-issue every tracked filter on `client`; failures are logged, not pruned
    ///
    /// Requests are issued in filter order and awaited together, so the
    /// restore costs one broker round trip rather than one per filter.
    pub async fn restore(
        &self,
        identity: &ConnectionIdentity,
        client: &dyn TransportClient,
    ) -> RestoreReport {
        let filters: Vec<(String, QoS)> = self
            .subscriptions
            .get(identity.as_str())
            .map(|filters| filters.iter().map(|(f, q)| (f.clone(), *q)).collect())
            .unwrap_or_default();

        let results = join_all(
            filters
                .iter()
                .map(|(filter, qos)| client.subscribe(filter, *qos)),
        )
        .await;

        let mut report = RestoreReport::default();
        for ((filter, _), result) in filters.into_iter().zip(results) {
            match result {
                Ok(()) => report.restored.push(filter),
                Err(e) => {
                    let reason = sanitize_error_message(&e.to_string());
                    warn!(
                        identity = %identity,
                        filter = %filter,
                        error = %reason,
                        "Failed to restore subscription"
                    );
                    self.metrics.subscription_restore_failed();
                    report.failed.push((filter, reason));
                }
            }
        }
        report
    }
}

#[async_trait]
impl ConnectionObserver for SubscriptionRegistry {
    async fn on_connected(&self, identity: &ConnectionIdentity, client: Arc<dyn TransportClient>) {
        let report = self.restore(identity, client.as_ref()).await;
        if report.restored.is_empty() && report.failed.is_empty() {
            return;
        }
        info!(
            identity = %identity,
            restored = report.restored.len(),
            failed = report.failed.len(),
            "Subscriptions restored"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MessageChannel;
    use crate::config::MqttSection;
    use crate::identity::BrokerConfig;
    use crate::testing::mocks::{MockCall, MockTransportFactory};

    struct Fixture {
        supervisor: Arc<ConnectionSupervisor>,
        registry: Arc<SubscriptionRegistry>,
        factory: Arc<MockTransportFactory>,
        metrics: Arc<IngestMetrics>,
    }

    fn fixture() -> Fixture {
        let factory = Arc::new(MockTransportFactory::new());
        let metrics = Arc::new(IngestMetrics::new());
        let supervisor = Arc::new(ConnectionSupervisor::new(
            factory.clone(),
            Arc::new(MessageChannel::unbounded()),
            MqttSection::default(),
            metrics.clone(),
            None,
        ));
        let registry = SubscriptionRegistry::new(supervisor.clone(), metrics.clone());
        Fixture {
            supervisor,
            registry,
            factory,
            metrics,
        }
    }

    fn config(identity: &str) -> BrokerConfig {
        BrokerConfig::new(ConnectionIdentity::new(identity).unwrap(), "localhost", 1883)
    }

    #[test]
    fn test_validate_topic_filter() {
        for valid in ["a/b", "sensors/+/temp", "#", "a/#", "+", "+/+", "/a", "a//b"] {
            assert!(validate_topic_filter(valid).is_ok(), "{valid} should be valid");
        }
        for invalid in ["", "a/#/b", "a#", "a/b#", "a+/b", "a/+b", "nul\0byte"] {
            assert!(
                matches!(
                    validate_topic_filter(invalid),
                    Err(IngestError::InvalidTopicFilter { .. })
                ),
                "{invalid:?} should be invalid"
            );
        }
    }

    #[test]
    fn test_overlong_filter_rejected() {
        let filter = "a".repeat(MAX_FILTER_LEN + 1);
        assert!(validate_topic_filter(&filter).is_err());
    }

    #[tokio::test]
    async fn test_subscribe_list_unsubscribe() {
        let f = fixture();
        f.supervisor.connect(config("b1")).await;

        f.registry.subscribe("b1", "a/b").await.unwrap();
        assert_eq!(f.registry.list("b1"), vec!["a/b"]);

        f.registry.unsubscribe("b1", "a/b").await.unwrap();
        assert!(f.registry.list("b1").is_empty());

        let client = f.factory.client_for("b1").unwrap();
        assert_eq!(client.unsubscribe_calls(), vec!["a/b"]);
    }

    #[tokio::test]
    async fn test_subscribe_twice_keeps_one_entry_but_reissues() {
        let f = fixture();
        f.supervisor.connect(config("b1")).await;

        f.registry.subscribe("b1", "a/b").await.unwrap();
        f.registry.subscribe("b1", "a/b").await.unwrap();

        assert_eq!(f.registry.list("b1"), vec!["a/b"]);
        assert_eq!(
            f.factory.client_for("b1").unwrap().subscribe_calls(),
            vec!["a/b", "a/b"]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_untracked_is_noop() {
        let f = fixture();
        f.supervisor.connect(config("b1")).await;

        f.registry.unsubscribe("b1", "never/subscribed").await.unwrap();
        f.registry.unsubscribe("ghost", "x").await.unwrap();

        assert!(f.factory.client_for("b1").unwrap().unsubscribe_calls().is_empty());
    }

    #[tokio::test]
    async fn test_list_unknown_identity_is_empty() {
        let f = fixture();
        assert!(f.registry.list("ghost").is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_requires_live_client() {
        let f = fixture();

        let result = f.registry.subscribe("b1", "a/b").await;
        assert!(matches!(result, Err(IngestError::UnknownConnection(_))));
        assert!(f.registry.list("b1").is_empty());
    }

    #[tokio::test]
    async fn test_invalid_filter_makes_no_protocol_call() {
        let f = fixture();
        f.supervisor.connect(config("b1")).await;

        let result = f.registry.subscribe("b1", "a/#/b").await;

        assert!(matches!(result, Err(IngestError::InvalidTopicFilter { .. })));
        assert!(f.factory.client_for("b1").unwrap().subscribe_calls().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_subscribe_is_not_tracked() {
        let f = fixture();
        f.factory.reject_filter("forbidden/#");
        f.supervisor.connect(config("b1")).await;

        let result = f.registry.subscribe("b1", "forbidden/#").await;

        assert!(matches!(result, Err(IngestError::Transport { .. })));
        assert!(f.registry.list("b1").is_empty());
    }

    #[tokio::test]
    async fn test_subscriptions_survive_disconnect_and_restore_on_connect() {
        let f = fixture();
        f.supervisor.connect(config("b1")).await;
        f.registry.subscribe("b1", "x/1").await.unwrap();
        f.registry.subscribe("b1", "x/2").await.unwrap();

        f.supervisor.disconnect("b1").await;
        assert_eq!(f.registry.list("b1"), vec!["x/1", "x/2"]);

        f.supervisor.connect(config("b1")).await;

        let client = f.factory.client_for("b1").unwrap();
        assert_eq!(client.subscribe_calls(), vec!["x/1", "x/2"]);
    }

    #[tokio::test]
    async fn test_restore_happens_before_new_messages() {
        let f = fixture();
        f.supervisor.connect(config("b1")).await;
        f.registry.subscribe("b1", "x/1").await.unwrap();
        f.registry.subscribe("b1", "x/2").await.unwrap();
        let client = f.factory.client_for("b1").unwrap();

        client.drop_connection("network reset").await;
        client.reconnect().await;
        client.deliver("x/1", "after");

        let calls = client.calls();
        let reconnected = calls
            .iter()
            .position(|c| matches!(c, MockCall::Reconnect))
            .unwrap();
        let delivered = calls
            .iter()
            .position(|c| matches!(c, MockCall::Deliver(t) if t == "x/1"))
            .unwrap();
        let resubscribed: Vec<&MockCall> = calls[reconnected..delivered]
            .iter()
            .filter(|c| matches!(c, MockCall::Subscribe(_)))
            .collect();
        assert_eq!(
            resubscribed,
            vec![
                &MockCall::Subscribe("x/1".to_string()),
                &MockCall::Subscribe("x/2".to_string())
            ]
        );
        assert!(f.supervisor.is_connected("b1"));
    }

    #[tokio::test]
    async fn test_partial_restore_failure_keeps_tracked_set() {
        let f = fixture();
        f.supervisor.connect(config("b1")).await;
        f.registry.subscribe("b1", "x/1").await.unwrap();
        f.registry.subscribe("b1", "x/2").await.unwrap();
        let client = f.factory.client_for("b1").unwrap();

        f.factory.reject_filter("x/2");
        client.drop_connection("network reset").await;
        client.reconnect().await;

        assert!(f.supervisor.is_connected("b1"));
        assert_eq!(f.registry.list("b1"), vec!["x/1", "x/2"]);
        assert_eq!(
            f.metrics.snapshot().connections.subscription_restore_failures,
            1
        );
    }

    #[tokio::test]
    async fn test_restore_report() {
        let f = fixture();
        f.supervisor.connect(config("b1")).await;
        f.registry.subscribe("b1", "x/1").await.unwrap();
        f.registry.subscribe("b1", "x/2").await.unwrap();
        f.factory.reject_filter("x/1");

        let client = f.supervisor.live_client("b1").unwrap();
        let report = f
            .registry
            .restore(&ConnectionIdentity::new("b1").unwrap(), client.as_ref())
            .await;

        assert_eq!(report.restored, vec!["x/2"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "x/1");
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn test_unsubscribe_without_live_client_untracks_only() {
        let f = fixture();
        f.supervisor.connect(config("b1")).await;
        f.registry.subscribe("b1", "x/1").await.unwrap();
        f.supervisor.disconnect("b1").await;

        f.registry.unsubscribe("b1", "x/1").await.unwrap();

        assert!(f.registry.list("b1").is_empty());
    }

    #[tokio::test]
    async fn test_forget() {
        let f = fixture();
        f.supervisor.connect(config("b1")).await;
        f.registry.subscribe("b1", "x/1").await.unwrap();

        f.registry.forget("b1");

        assert!(f.registry.list("b1").is_empty());
    }
}
