//! Subscription tracking and restoration across reconnects


use mqtt_ingest::testing::MockCall;
use mqtt_ingest::IngestError;
use test_helpers::{broker, harness};

#[tokio::test]
async fn test_subscribe_list_unsubscribe_round_trip() {
    let h = harness();
    h.service.connect(broker("b1")).await;

    h.service.subscribe("b1", "a/b").await.unwrap();
    assert!(h.service.list_subscriptions("b1").contains(&"a/b".to_string()));

    h.service.unsubscribe("b1", "a/b").await.unwrap();
    assert!(!h.service.list_subscriptions("b1").contains(&"a/b".to_string()));

    h.service.unsubscribe("b1", "never/subscribed").await.unwrap();
}

#[tokio::test]
async fn test_list_for_unknown_identity_is_empty() {
    let h = harness();
    assert!(h.service.list_subscriptions("ghost").is_empty());
}

#[tokio::test]
async fn test_subscribe_without_connection_fails() {
    let h = harness();
    let result = h.service.subscribe("b1", "a/b").await;
    assert!(matches!(result, Err(IngestError::UnknownConnection(_))));
}

#[tokio::test]
async fn test_reconnect_resubscribes_before_new_messages() {
    let h = harness();
    h.service.connect(broker("b1")).await;
    h.service.subscribe("b1", "x/1").await.unwrap();
    h.service.subscribe("b1", "x/2").await.unwrap();
    let client = h.factory.client_for("b1").unwrap();

    client.drop_connection("keep-alive timeout").await;
    assert!(!h.service.is_connected("b1"));
    client.reconnect().await;
    client.deliver("x/1", "fresh");

    let calls = client.calls();
    let reconnect = calls.iter().position(|c| *c == MockCall::Reconnect).unwrap();
    let delivered = calls
        .iter()
        .position(|c| *c == MockCall::Deliver("x/1".to_string()))
        .unwrap();
    let restored: Vec<_> = calls[reconnect..delivered]
        .iter()
        .filter_map(|c| match c {
            MockCall::Subscribe(filter) => Some(filter.as_str()),
            _ => None,
        })
        .collect();

    assert_eq!(restored, vec!["x/1", "x/2"]);
    assert!(h.service.is_connected("b1"));
    assert_eq!(h.service.channel().len(), 1);
}

#[tokio::test]
async fn test_subscriptions_retained_across_disconnect() {
    let h = harness();
    h.service.connect(broker("b1")).await;
    h.service.subscribe("b1", "sensors/+/temp").await.unwrap();

    h.service.disconnect("b1").await;
    assert_eq!(h.service.list_subscriptions("b1"), vec!["sensors/+/temp"]);

    h.service.connect(broker("b1")).await;
    let client = h.factory.client_for("b1").unwrap();
    assert_eq!(client.subscribe_calls(), vec!["sensors/+/temp"]);
}

#[tokio::test]
async fn test_forget_clears_retained_subscriptions() {
    let h = harness();
    h.service.connect(broker("b1")).await;
    h.service.subscribe("b1", "a/#").await.unwrap();
    h.service.disconnect("b1").await;

    h.service.forget_subscriptions("b1");
    h.service.connect(broker("b1")).await;

    assert!(h.service.list_subscriptions("b1").is_empty());
    assert!(h
        .factory
        .client_for("b1")
        .unwrap()
        .subscribe_calls()
        .is_empty());
}

#[tokio::test]
async fn test_rejected_restore_keeps_filter_tracked() {
    let h = harness();
    h.service.connect(broker("b1")).await;
    h.service.subscribe("b1", "ok/1").await.unwrap();
    h.service.subscribe("b1", "revoked/1").await.unwrap();
    h.factory.reject_filter("revoked/1");

    let client = h.factory.client_for("b1").unwrap();
    client.drop_connection("reset").await;
    client.reconnect().await;

    assert!(h.service.is_connected("b1"));
    assert_eq!(h.service.list_subscriptions("b1"), vec!["ok/1", "revoked/1"]);
    assert_eq!(
        h.service
            .metrics()
            .snapshot()
            .connections
            .subscription_restore_failures,
        1
    );
}

#[tokio::test]
async fn test_invalid_filters_are_rejected() {
    let h = harness();
    h.service.connect(broker("b1")).await;

    for filter in ["", "a/#/b", "a/b+"] {
        let result = h.service.subscribe("b1", filter).await;
        assert!(
            matches!(result, Err(IngestError::InvalidTopicFilter { .. })),
            "{filter:?} should be rejected"
        );
    }
    assert!(h.service.list_subscriptions("b1").is_empty());
}
