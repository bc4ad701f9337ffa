//! Connection supervision behaviour through the public service API


use mqtt_ingest::supervisor::{ConnectionState, ConnectionStatus};
use mqtt_ingest::transport::TransportError;
use mqtt_ingest::IngestError;
use test_helpers::{broker, harness};

#[tokio::test]
async fn test_never_connected_identity_is_disconnected_without_error() {
    let h = harness();

    for identity in ["b1", "tenant-42", "anything"] {
        assert_eq!(h.service.status(identity), ConnectionStatus::disconnected());
        assert!(!h.service.is_connected(identity));
    }
}

#[tokio::test]
async fn test_connect_twice_yields_single_client() {
    let h = harness();

    assert!(h.service.connect(broker("b1")).await);
    assert!(h.service.connect(broker("b1")).await);

    assert_eq!(h.factory.created_count(), 1);
    assert_eq!(h.factory.live_handles(), 1);
}

#[tokio::test]
async fn test_disconnect_then_status_is_disconnected() {
    let h = harness();
    h.service.connect(broker("b1")).await;

    h.service.disconnect("b1").await;

    assert!(!h.service.is_connected("b1"));
    assert_eq!(h.service.status("b1"), ConnectionStatus::disconnected());
    assert_eq!(h.factory.live_handles(), 0);
}

#[tokio::test]
async fn test_failed_connect_reports_sanitised_error() {
    let h = harness();
    h.factory.fail_next_connect(TransportError::Rejected(
        "not authorised, password=hunter2".to_string(),
    ));

    assert!(!h.service.connect(broker("b1")).await);

    let status = h.service.status("b1");
    assert_eq!(status.state, ConnectionState::Error);
    let error = status.last_error.expect("error recorded");
    assert!(error.contains("not authorised"));
    assert!(!error.contains("hunter2"));

    // A later attempt can still succeed
    assert!(h.service.connect(broker("b1")).await);
    assert_eq!(h.service.status("b1"), ConnectionStatus::connected());
}

#[tokio::test]
async fn test_connections_are_independent() {
    let h = harness();
    h.factory.fail_next_connect(TransportError::ConnectFailed("refused".to_string()));

    assert!(!h.service.connect(broker("bad")).await);
    assert!(h.service.connect(broker("good")).await);

    h.factory
        .client_for("good")
        .unwrap()
        .drop_connection("reset")
        .await;
    assert!(h.service.connect(broker("other")).await);

    assert_eq!(h.service.status("bad").state, ConnectionState::Error);
    assert_eq!(h.service.status("good").state, ConnectionState::Error);
    assert!(h.service.is_connected("other"));
}

#[tokio::test]
async fn test_publish_unknown_identity_is_typed_failure() {
    let h = harness();

    let error = h
        .service
        .publish("ghost", "cmd/1", "on")
        .await
        .expect_err("no live client");

    assert!(matches!(error, IngestError::UnknownConnection(_)));
    assert!(error.is_not_connected());
}

#[tokio::test]
async fn test_publish_reaches_client() {
    let h = harness();
    h.service.connect(broker("b1")).await;

    h.service.publish("b1", "cmd/valve", "open").await.unwrap();

    assert_eq!(
        h.factory.client_for("b1").unwrap().published(),
        vec![("cmd/valve".to_string(), b"open".to_vec())]
    );
}

#[tokio::test]
async fn test_disconnect_unknown_identity_is_silent() {
    let h = harness();
    h.service.disconnect("never-seen").await;
    assert_eq!(h.service.status("never-seen"), ConnectionStatus::disconnected());
}
