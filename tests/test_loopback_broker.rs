//! The service over the rumqttc transport, against the in-process broker


use mqtt_ingest::config::{MqttSection, ServiceConfig};
use mqtt_ingest::identity::{BrokerConfig, ConnectionIdentity};
use mqtt_ingest::supervisor::ConnectionState;
use mqtt_ingest::testing::{LoopbackBroker, MemoryRecordStore};
use mqtt_ingest::transport::mqtt::{ReconnectConfig, RumqttTransportFactory};
use mqtt_ingest::transport::TransportError;
use mqtt_ingest::{IngestError, IngestService};
use std::sync::Arc;
use std::time::Duration;

fn loopback(broker: &LoopbackBroker) -> BrokerConfig {
    BrokerConfig::new(
        ConnectionIdentity::new("b1").unwrap(),
        "127.0.0.1",
        broker.port(),
    )
}

fn service_with(mqtt: MqttSection) -> (IngestService, Arc<MemoryRecordStore>) {
    let config = ServiceConfig {
        mqtt,
        ..Default::default()
    };
    let factory = Arc::new(RumqttTransportFactory::new(config.mqtt.clone()));
    let store = Arc::new(MemoryRecordStore::new());
    (IngestService::new(config, factory, store.clone()), store)
}

fn small_queue() -> MqttSection {
    MqttSection {
        connect_timeout_secs: 2,
        request_capacity: 2,
        reconnect: ReconnectConfig {
            max_attempts: Some(5),
            backoff_pattern: vec![50],
            sustained_delay: 50,
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_broker_rejected_subscription_is_not_tracked() {
    let broker = LoopbackBroker::start().await.unwrap();
    let (service, _store) = service_with(small_queue());
    assert!(service.connect(loopback(&broker)).await);

    let rejected = service.subscribe("b1", "deny/topic").await;
    service.subscribe("b1", "plant/+/temp").await.unwrap();

    match rejected {
        Err(IngestError::Transport {
            source: TransportError::SubscribeFailed(reason),
            ..
        }) => assert!(reason.contains("deny/topic"), "{reason}"),
        other => panic!("Expected a rejected subscription, got {other:?}"),
    }
    assert_eq!(service.list_subscriptions("b1"), vec!["plant/+/temp"]);
    assert_eq!(broker.subscribed(), vec!["deny/topic", "plant/+/temp"]);

    service.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_restores_more_filters_than_request_capacity() {
    let broker = LoopbackBroker::start().await.unwrap();
    let (service, _store) = service_with(small_queue());
    let filters = ["line/1/#", "line/2/#", "line/3/#", "line/4/#"];

    assert!(service.connect(loopback(&broker)).await);
    for filter in filters {
        service.subscribe("b1", filter).await.unwrap();
    }
    service.disconnect("b1").await;

    assert!(service.connect(loopback(&broker)).await);

    assert_eq!(service.status("b1").state, ConnectionState::Connected);
    assert_eq!(service.list_subscriptions("b1"), filters);
    let subscribed = broker.subscribed();
    assert_eq!(subscribed.len(), 8);
    assert_eq!(subscribed[4..], filters);

    service.shutdown().await;
}

#[tokio::test]
async fn test_broker_drop_recovers_and_keeps_ingesting() {
    let broker = LoopbackBroker::start().await.unwrap();
    let (service, store) = service_with(small_queue());
    assert!(service.connect(loopback(&broker)).await);
    service.subscribe("b1", "plant/+/temp").await.unwrap();
    service.subscribe("b1", "plant/+/rpm").await.unwrap();
    assert!(service.start_consumer());

    broker.drop_sessions();

    assert!(broker.wait_for_sessions(2, Duration::from_secs(5)).await);
    assert!(broker.wait_for_subscriptions(4, Duration::from_secs(5)).await);
    assert!(
        test_helpers::eventually(|| service.status("b1").state == ConnectionState::Connected)
            .await
    );

    broker.publish("plant/7/temp", b"23.5");

    let stored = test_helpers::eventually(|| {
        store
            .records()
            .iter()
            .any(|record| record.topic == "plant/7/temp")
    })
    .await;
    assert!(stored, "message after the reconnect should be stored");

    service.shutdown().await;
}
