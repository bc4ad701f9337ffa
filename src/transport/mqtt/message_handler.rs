//! Pure routing of rumqttc events
//!
//! Turns raw event-loop output into [`EventRoute`] decisions so the impure
//! client loop only has to act on them.

use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, SubscribeReasonCode};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => match connack.code {
                    ConnectReturnCode::Success => EventRoute::ConnectionAcknowledged {
                        session_present: connack.session_present,
                    },
                    code => EventRoute::ConnectionRefused(format!("{code:?}")),
                },
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    rejected: Self::count_rejected(&suback.return_codes),
                },
                Packet::UnsubAck(unsuback) => EventRoute::UnsubscribeConfirmed {
                    packet_id: unsuback.pkid,
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                EventRoute::SubscribeSent { packet_id: *pkid }
            }
            Event::Outgoing(Outgoing::Unsubscribe(pkid)) => {
                EventRoute::UnsubscribeSent { packet_id: *pkid }
            }
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Number of filters the broker refused in one SubAck (pure function)
    pub fn count_rejected(return_codes: &[SubscribeReasonCode]) -> usize {
        return_codes
            .iter()
            .filter(|code| matches!(code, SubscribeReasonCode::Failure))
            .count()
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Session established
    ConnectionAcknowledged { session_present: bool },
    /// Broker answered CONNECT with a refusal code
    ConnectionRefused(String),
    /// Message received on a subscribed topic
    MessageReceived {
        topic: String,
        payload: bytes::Bytes,
    },
    /// Broker sent DISCONNECT
    Disconnected,
    /// Our own DISCONNECT left the client
    DisconnectSent,
    /// SUBSCRIBE written to the socket under `packet_id`
    SubscribeSent { packet_id: u16 },
    /// Subscription answered; `rejected` filters were refused
    SubscriptionConfirmed { packet_id: u16, rejected: usize },
    UnsubscribeSent { packet_id: u16 },
    UnsubscribeConfirmed { packet_id: u16 },
    /// Infrastructure event (PingResp, PubAck...)
    InfrastructureEvent(String),
    /// Other outgoing traffic
    OutgoingEvent,
}
