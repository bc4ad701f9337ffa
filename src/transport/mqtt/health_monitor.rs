//! Pure reconnection decisions and link-state transitions for the MQTT client

use super::connection::{LinkState, ReconnectConfig};
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine if reconnection should be attempted (pure function)
    /// Supports unlimited retries when max_attempts is None
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let backoff_delay = config.calculate_backoff_delay(current_attempts + 1);
        ReconnectionDecision::Proceed {
            attempt: current_attempts + 1,
            delay_ms: backoff_delay,
        }
    }

    /// Determine next state after connection event (pure function)
    pub fn determine_next_state(event: LinkEvent) -> LinkState {
        match event {
            LinkEvent::ConnAckReceived => LinkState::Connected,
            LinkEvent::DisconnectedByBroker => {
                LinkState::Disconnected("Broker disconnected".to_string())
            }
            LinkEvent::NetworkError(error) => LinkState::Disconnected(error),
            LinkEvent::ClientDisconnected => {
                LinkState::Disconnected("Client disconnected".to_string())
            }
            LinkEvent::ReconnectionStarted(attempt) => LinkState::Reconnecting(attempt),
            LinkEvent::PermanentFailure(reason) => LinkState::PermanentlyDisconnected(reason),
        }
    }

    /// Check if link state still accepts protocol requests (pure function)
    ///
    /// Requests queued while the link is down are flushed by rumqttc once it
    /// reconnects, so only a permanently failed link refuses them.
    pub fn accepts_requests(state: &LinkState) -> bool {
        !matches!(state, LinkState::PermanentlyDisconnected(_))
    }

    /// Log link state transition
    pub fn log_state_transition(identity: &str, from: &LinkState, to: &LinkState) {
        match (from, to) {
            (LinkState::Connecting, LinkState::Connected) => {
                info!(identity, "MQTT connection established");
            }
            (LinkState::Connected, LinkState::Disconnected(reason)) => {
                warn!(identity, reason = %reason, "MQTT connection lost");
            }
            (_, LinkState::Reconnecting(attempt)) => {
                info!(identity, attempt, "Starting reconnection attempt");
            }
            (LinkState::Reconnecting(_), LinkState::Connected) => {
                info!(identity, "Reconnection successful");
            }
            (_, LinkState::PermanentlyDisconnected(reason)) => {
                error!(identity, reason = %reason, "MQTT connection permanently failed");
            }
            _ => {
                info!(identity, "MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger link-state transitions
#[derive(Debug, Clone)]
pub enum LinkEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ClientDisconnected,
    ReconnectionStarted(u32),
    PermanentFailure(String),
}
