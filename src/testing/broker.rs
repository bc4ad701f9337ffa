//! In-process MQTT 3.1.1 broker on a loopback port
//!
//! Speaks just enough of the protocol for the rumqttc client: CONNECT,
//! SUBSCRIBE, UNSUBSCRIBE, PINGREQ and DISCONNECT. Filters under `deny/`
//! are refused in the SUBACK. Every filter the broker is asked for is
//! recorded in arrival order, across all sessions.

use bytes::BytesMut;
use rumqttc::mqttbytes::{self, v4};
use rumqttc::{
    ConnAck, ConnectReturnCode, Packet, Publish, QoS, SubAck, SubscribeReasonCode, UnsubAck,
};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Filters with this prefix get a failure return code
pub const DENIED_PREFIX: &str = "deny/";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
enum Control {
    /// Close every open session without a DISCONNECT
    DropSessions,
    /// Deliver a publish to every subscribed session
    Publish(String, Vec<u8>),
}

#[derive(Default)]
struct Recorded {
    subscribed: Mutex<Vec<String>>,
    unsubscribed: Mutex<Vec<String>>,
    sessions: AtomicUsize,
}

/// Loopback broker; the accept loop stops when this is dropped
pub struct LoopbackBroker {
    port: u16,
    recorded: Arc<Recorded>,
    control: broadcast::Sender<Control>,
    accept_loop: JoinHandle<()>,
}

impl LoopbackBroker {
    /// Bind 127.0.0.1 on an ephemeral port and start accepting
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let recorded = Arc::new(Recorded::default());
        let (control, _) = broadcast::channel(16);

        let accept_loop = tokio::spawn(accept(listener, recorded.clone(), control.clone()));
        Ok(Self {
            port,
            recorded,
            control,
            accept_loop,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Every SUBSCRIBE filter received, in arrival order
    pub fn subscribed(&self) -> Vec<String> {
        lock(&self.recorded.subscribed).clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        lock(&self.recorded.unsubscribed).clone()
    }

    /// CONNECTs accepted so far
    pub fn sessions(&self) -> usize {
        self.recorded.sessions.load(Ordering::Acquire)
    }

    /// Cut every open session as a network failure would
    pub fn drop_sessions(&self) {
        let _ = self.control.send(Control::DropSessions);
    }

    /// Send a QoS 0 publish on every open session
    pub fn publish(&self, topic: &str, payload: &[u8]) {
        let _ = self
            .control
            .send(Control::Publish(topic.to_string(), payload.to_vec()));
    }

    /// Poll until `subscribed()` holds at least `count` filters
    pub async fn wait_for_subscriptions(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.subscribed().len() >= count)
            .await
    }

    /// Poll until at least `count` sessions were accepted
    pub async fn wait_for_sessions(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.sessions() >= count).await
    }

    async fn wait_until(&self, timeout: Duration, ready: impl Fn() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if ready() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        ready()
    }
}

impl Drop for LoopbackBroker {
    fn drop(&mut self) {
        self.accept_loop.abort();
        let _ = self.control.send(Control::DropSessions);
    }
}

async fn accept(
    listener: TcpListener,
    recorded: Arc<Recorded>,
    control: broadcast::Sender<Control>,
) {
    while let Ok((socket, _)) = listener.accept().await {
        let session = Session {
            socket,
            recorded: recorded.clone(),
            subscribed: false,
        };
        tokio::spawn(session.serve(control.subscribe()));
    }
}

struct Session {
    socket: TcpStream,
    recorded: Arc<Recorded>,
    subscribed: bool,
}

impl Session {
    async fn serve(mut self, mut control: broadcast::Receiver<Control>) {
        let mut incoming = BytesMut::with_capacity(4096);

        loop {
            loop {
                match v4::read(&mut incoming, MAX_PACKET_SIZE) {
                    Ok(packet) => {
                        if !self.answer(packet).await {
                            return;
                        }
                    }
                    Err(mqttbytes::Error::InsufficientBytes(_)) => break,
                    Err(e) => {
                        debug!(error = ?e, "Loopback broker got a malformed packet");
                        return;
                    }
                }
            }

            tokio::select! {
                command = control.recv() => match command {
                    Ok(Control::Publish(topic, payload)) => {
                        if self.subscribed {
                            let publish =
                                Packet::Publish(Publish::new(topic, QoS::AtMostOnce, payload));
                            if !self.send(publish).await {
                                return;
                            }
                        }
                    }
                    Ok(Control::DropSessions) | Err(_) => return,
                },
                read = self.socket.read_buf(&mut incoming) => match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                },
            }
        }
    }

    /// Reply to one client packet; false closes the session
    async fn answer(&mut self, packet: Packet) -> bool {
        match packet {
            Packet::Connect(_) => {
                self.recorded.sessions.fetch_add(1, Ordering::AcqRel);
                self.send(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false)))
                    .await
            }
            Packet::Subscribe(subscribe) => {
                let return_codes = subscribe
                    .filters
                    .iter()
                    .map(|filter| {
                        lock(&self.recorded.subscribed).push(filter.path.clone());
                        if filter.path.starts_with(DENIED_PREFIX) {
                            SubscribeReasonCode::Failure
                        } else {
                            SubscribeReasonCode::Success(filter.qos)
                        }
                    })
                    .collect();
                self.subscribed = true;
                self.send(Packet::SubAck(SubAck::new(subscribe.pkid, return_codes)))
                    .await
            }
            Packet::Unsubscribe(unsubscribe) => {
                lock(&self.recorded.unsubscribed).extend(unsubscribe.topics);
                self.send(Packet::UnsubAck(UnsubAck::new(unsubscribe.pkid)))
                    .await
            }
            Packet::PingReq => self.send(Packet::PingResp).await,
            Packet::Disconnect => false,
            _ => true,
        }
    }

    async fn send(&mut self, packet: Packet) -> bool {
        let mut outgoing = BytesMut::new();
        let written = match &packet {
            Packet::ConnAck(connack) => connack.write(&mut outgoing),
            Packet::SubAck(suback) => suback.write(&mut outgoing),
            Packet::UnsubAck(unsuback) => unsuback.write(&mut outgoing),
            Packet::Publish(publish) => publish.write(&mut outgoing),
            Packet::PingResp => v4::PingResp.write(&mut outgoing),
            _ => return true,
        };
        if written.is_err() {
            return false;
        }
        self.socket.write_all(&outgoing).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{AsyncClient, Event, MqttOptions};

    #[tokio::test]
    async fn test_broker_acknowledges_rumqttc_client() {
        let broker = LoopbackBroker::start().await.unwrap();
        let options = MqttOptions::new("loopback-test", "127.0.0.1", broker.port());
        let (client, mut event_loop) = AsyncClient::new(options, 10);

        client.subscribe("deny/x", QoS::AtLeastOnce).await.unwrap();

        let mut suback = None;
        for _ in 0..10 {
            if let Event::Incoming(Packet::SubAck(ack)) = event_loop.poll().await.unwrap() {
                suback = Some(ack);
                break;
            }
        }

        let suback = suback.expect("no SubAck received");
        assert_eq!(suback.return_codes, vec![SubscribeReasonCode::Failure]);
        assert_eq!(broker.subscribed(), vec!["deny/x"]);
        assert_eq!(broker.sessions(), 1);
    }
}
