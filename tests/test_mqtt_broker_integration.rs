//! Integration tests against a real MQTT broker
//!
//! Ignored by default. Start a broker on localhost:1883 and run:
//!
//! ```bash
//! docker run -d -p 1883:1883 eclipse-mosquitto:2 mosquitto -c /mosquitto-no-auth.conf
//! cargo test --test test_mqtt_broker_integration -- --ignored
//! ```


use mqtt_ingest::config::ServiceConfig;
use mqtt_ingest::identity::{BrokerConfig, ConnectionIdentity};
use mqtt_ingest::supervisor::ConnectionState;
use mqtt_ingest::testing::MemoryRecordStore;
use mqtt_ingest::transport::mqtt::RumqttTransportFactory;
use mqtt_ingest::IngestService;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn local_broker(identity: &str) -> BrokerConfig {
    BrokerConfig::new(ConnectionIdentity::new(identity).unwrap(), "localhost", 1883)
        .with_client_id(format!("{identity}-{}", Uuid::new_v4()))
}

fn real_service() -> (IngestService, Arc<MemoryRecordStore>) {
    let config = ServiceConfig::default();
    let factory = Arc::new(RumqttTransportFactory::new(config.mqtt.clone()));
    let store = Arc::new(MemoryRecordStore::new());
    (IngestService::new(config, factory, store.clone()), store)
}

#[tokio::test]
#[ignore = "requires an MQTT broker on localhost:1883"]
async fn test_connect_to_real_broker() {
    let (service, _store) = real_service();

    assert!(service.connect(local_broker("real-connect")).await);
    assert_eq!(service.status("real-connect").state, ConnectionState::Connected);

    service.disconnect("real-connect").await;
    assert_eq!(
        service.status("real-connect").state,
        ConnectionState::Disconnected
    );
}

#[tokio::test]
#[ignore = "requires an MQTT broker on localhost:1883"]
async fn test_published_message_is_ingested() {
    let (service, store) = real_service();
    let topic_root = format!("mqtt-ingest-test/{}", Uuid::new_v4());

    assert!(service.connect(local_broker("listener")).await);
    assert!(service.connect(local_broker("sender")).await);
    service
        .subscribe("listener", &format!("{topic_root}/+/temp"))
        .await
        .unwrap();
    service.start_consumer();

    // Give the broker time to register the subscription
    tokio::time::sleep(Duration::from_millis(300)).await;
    service
        .publish("sender", &format!("{topic_root}/7/temp"), "23.5")
        .await
        .unwrap();

    let expected = format!("{topic_root}/7/temp");
    let delivered = test_helpers::eventually(|| {
        store
            .records()
            .iter()
            .any(|record| record.topic == expected && record.identity.as_str() == "listener")
    })
    .await;
    assert!(delivered, "published message should be stored");

    service.shutdown().await;
}

#[tokio::test]
#[ignore = "requires an MQTT broker on localhost:1883"]
async fn test_unreachable_port_fails_connect() {
    let (service, _store) = real_service();
    let broker = BrokerConfig::new(ConnectionIdentity::new("nowhere").unwrap(), "localhost", 1);

    assert!(!service.connect(broker).await);
    assert_eq!(service.status("nowhere").state, ConnectionState::Error);
}
