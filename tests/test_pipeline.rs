//! End-to-end ingestion: transport callback → channel → consumer → store


use mqtt_ingest::channel::MessageChannel;
use mqtt_ingest::config::{ChannelSection, IngestMode, IngestSection, ServiceConfig};
use mqtt_ingest::identity::{ConnectionIdentity, InboundMessage};
use mqtt_ingest::supervisor::{ConnectionState, ConnectionStatus};
use bytes::Bytes;
use std::time::Duration;
use test_helpers::{broker, eventually, harness, harness_with};

#[tokio::test]
async fn test_connect_subscribe_ingest_disconnect_scenario() {
    let h = harness();

    assert!(h.service.connect(broker("b1")).await);
    assert_eq!(h.service.status("b1").state, ConnectionState::Connected);

    h.service.subscribe("b1", "sensors/+/temp").await.unwrap();
    assert_eq!(h.service.list_subscriptions("b1"), vec!["sensors/+/temp"]);

    h.factory
        .client_for("b1")
        .unwrap()
        .deliver("sensors/7/temp", "23.5");
    let report = h.service.drain_batch().await;

    assert_eq!(report.persisted, 1);
    let records = h.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].topic, "sensors/7/temp");
    assert_eq!(records[0].document, "23.5");
    assert_eq!(records[0].identity.as_str(), "b1");

    h.service.disconnect("b1").await;
    assert_eq!(h.service.status("b1"), ConnectionStatus::disconnected());
    assert_eq!(h.service.list_subscriptions("b1"), vec!["sensors/+/temp"]);
}

#[tokio::test]
async fn test_batch_failure_isolation() {
    let h = harness();
    h.store.fail_topic("line/2");
    h.service.connect(broker("b1")).await;
    let client = h.factory.client_for("b1").unwrap();

    for topic in ["line/1", "line/2", "line/3"] {
        client.deliver(topic, "{}");
    }
    let report = h.service.drain_batch().await;

    assert_eq!(report.processed, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(h.store.topics(), vec!["line/1", "line/3"]);
    assert_eq!(h.service.metrics().snapshot().messages.failed, 1);
}

#[tokio::test]
async fn test_continuous_consumer_keeps_going_after_failure() {
    let h = harness();
    h.store.fail_topic("bad");
    h.service.connect(broker("b1")).await;
    h.service.start_consumer();
    let client = h.factory.client_for("b1").unwrap();

    client.deliver("good/1", "1");
    client.deliver("bad", "2");
    client.deliver("good/2", "3");

    assert!(eventually(|| h.store.topics().len() == 2).await);
    assert_eq!(h.store.topics(), vec!["good/1", "good/2"]);

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_bounded_channel_drops_overflow_in_fifo_order() {
    let config = ServiceConfig {
        channel: ChannelSection { capacity: Some(3) },
        ..Default::default()
    };
    let h = harness_with(config);
    h.service.connect(broker("b1")).await;
    let client = h.factory.client_for("b1").unwrap();

    for i in 0..4 {
        client.deliver(&format!("t/{i}"), "x");
    }

    assert_eq!(h.service.channel().len(), 3);
    assert_eq!(h.service.channel().dropped(), 1);
    assert_eq!(h.service.metrics().snapshot().messages.dropped, 1);

    h.service.drain_batch().await;
    assert_eq!(h.store.topics(), vec!["t/0", "t/1", "t/2"]);
}

#[test]
fn test_channel_backpressure_signal() {
    let channel = MessageChannel::bounded(2);
    let id = ConnectionIdentity::new("b1").unwrap();
    let message = |topic: &str| InboundMessage::new(id.clone(), topic, Bytes::from_static(b"1"));

    assert!(channel.try_write(message("1")));
    assert!(channel.try_write(message("2")));
    assert!(!channel.try_write(message("3")));

    assert_eq!(channel.try_read().unwrap().topic, "1");
    assert_eq!(channel.try_read().unwrap().topic, "2");
    assert!(channel.try_read().is_none());
}

#[tokio::test]
async fn test_envelope_payload_becomes_structured_record() {
    let h = harness();
    h.service.connect(broker("plant")).await;

    h.factory.client_for("plant").unwrap().deliver(
        "plc/line-1",
        r#"{"time":"2024-05-01 08:30:00","Data":{"speed":12}}"#,
    );
    h.service.drain_batch().await;

    let record = &h.store.records()[0];
    assert_eq!(record.title, "plc/line-1-2024-05-01 08:30:00");
    assert_eq!(record.document, r#"{"speed":12}"#);
    assert_eq!(record.timestamp.to_rfc3339(), "2024-05-01T08:30:00+00:00");
}

#[tokio::test]
async fn test_notifications_are_best_effort_copies() {
    let h = harness();
    let mut notifications = h.service.subscribe_notifications();
    h.service.connect(broker("b1")).await;

    h.factory.client_for("b1").unwrap().deliver("a/b", "1");

    let notified = notifications.recv().await.unwrap();
    assert_eq!(notified.topic, "a/b");
    assert_eq!(h.service.channel().len(), 1);
}

#[tokio::test]
async fn test_shutdown_persists_queued_messages_in_batch_mode() {
    let config = ServiceConfig {
        ingest: IngestSection {
            mode: IngestMode::Batch,
            ..Default::default()
        },
        ..Default::default()
    };
    let h = harness_with(config);
    h.service.connect(broker("b1")).await;
    let client = h.factory.client_for("b1").unwrap();
    client.deliver("t/1", "1");
    client.deliver("t/2", "2");

    h.service.shutdown().await;

    assert_eq!(h.store.topics(), vec!["t/1", "t/2"]);
    assert!(!h.service.channel().try_write(InboundMessage::new(
        ConnectionIdentity::new("b1").unwrap(),
        "late",
        Bytes::new()
    )));
}

#[tokio::test]
async fn test_connection_state_is_recorded_in_store() {
    let h = harness();
    h.service.connect(broker("b1")).await;
    assert_eq!(h.store.connection_state("b1"), Some(true));

    h.factory
        .client_for("b1")
        .unwrap()
        .drop_connection("broker restart")
        .await;
    assert_eq!(h.store.connection_state("b1"), Some(false));
}

#[tokio::test]
async fn test_failing_state_store_does_not_block_connect() {
    let h = harness();
    h.store.fail_state_updates(true);

    assert!(h.service.connect(broker("b1")).await);
    assert!(h.service.is_connected("b1"));
    assert_eq!(
        h.service.metrics().snapshot().connections.state_update_failures,
        1
    );
}

#[tokio::test]
async fn test_shutdown_grace_bounds_a_stuck_store() {
    let config = ServiceConfig {
        ingest: IngestSection {
            shutdown_grace_secs: 1,
            store_timeout_secs: 5,
            ..Default::default()
        },
        ..Default::default()
    };
    let h = harness_with(config);
    h.store.set_latency(Duration::from_millis(400));
    h.service.connect(broker("b1")).await;
    let client = h.factory.client_for("b1").unwrap();
    for i in 0..20 {
        client.deliver(&format!("t/{i}"), "1");
    }
    h.service.start_consumer();

    let started = std::time::Instant::now();
    h.service.shutdown().await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(h.store.topics().len() < 20);
}

#[tokio::test]
async fn test_records_reach_json_lines_file() {
    use mqtt_ingest::store::JsonLinesStore;
    use mqtt_ingest::testing::MockTransportFactory;
    use mqtt_ingest::IngestService;
    use std::sync::Arc;

    let dir = tempfile::tempdir().unwrap();
    let store = JsonLinesStore::new(dir.path().join("out/records.jsonl"));
    let factory = Arc::new(MockTransportFactory::new());
    let service = IngestService::new(
        ServiceConfig::default(),
        factory.clone(),
        Arc::new(store.clone()),
    );

    service.connect(broker("b1")).await;
    let client = factory.client_for("b1").unwrap();
    client.deliver("sensors/1/temp", "20.1");
    client.deliver("sensors/2/temp", "20.2");
    service.shutdown().await;

    let records = store.read_all().await.unwrap();
    let topics: Vec<_> = records.iter().map(|r| r.topic.as_str()).collect();
    assert_eq!(topics, vec!["sensors/1/temp", "sensors/2/temp"]);
    assert_eq!(store.connection_state("b1"), Some(false));
}
