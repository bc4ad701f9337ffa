//! Per-connection state as seen by callers

use crate::error::sanitize_error_message;
use serde::Serialize;
use std::fmt;

/// Lifecycle state of one connection identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Error => "Error",
        };
        f.write_str(name)
    }
}

/// State plus the last error, if the state is `Error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    /// What every unknown identity reports
    pub fn disconnected() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_error: None,
        }
    }

    pub fn connecting() -> Self {
        Self {
            state: ConnectionState::Connecting,
            last_error: None,
        }
    }

    pub fn connected() -> Self {
        Self {
            state: ConnectionState::Connected,
            last_error: None,
        }
    }

    /// `Error` with a sanitised message
    pub fn error(message: impl AsRef<str>) -> Self {
        Self {
            state: ConnectionState::Error,
            last_error: Some(sanitize_error_message(message.as_ref())),
        }
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::disconnected()
    }
}
