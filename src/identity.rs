//! Connection identities, broker configuration and inbound message values
//!
//! These are the plain data types shared by every layer of the pipeline.
//! A [`ConnectionIdentity`] can only be constructed from a non-blank string,
//! so every other component can take one without re-validating it.

use crate::error::IngestError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Opaque key naming one broker connection within this process
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConnectionIdentity(Arc<str>);

impl ConnectionIdentity {
    /// Create an identity, rejecting empty or whitespace-only keys
    pub fn new(value: impl AsRef<str>) -> Result<Self, IngestError> {
        let value = value.as_ref();
        if value.trim().is_empty() {
            return Err(IngestError::InvalidIdentity(value.to_string()));
        }
        Ok(Self(Arc::from(value)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionIdentity({:?})", &*self.0)
    }
}

impl Borrow<str> for ConnectionIdentity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ConnectionIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ConnectionIdentity {
    type Error = IngestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for ConnectionIdentity {
    type Error = IngestError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ConnectionIdentity> for String {
    fn from(value: ConnectionIdentity) -> Self {
        value.0.to_string()
    }
}

/// Everything needed to (re)establish one broker connection
///
/// Supplied by the caller at connect time. The supervisor hands it to the
/// transport factory and does not keep it afterwards.
#[derive(Clone, PartialEq)]
pub struct BrokerConfig {
    pub identity: ConnectionIdentity,
    pub host: String,
    pub port: u16,
    /// Empty means "generate one" (see [`BrokerConfig::effective_client_id`])
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
}

impl BrokerConfig {
    /// Plain TCP config with no credentials and a generated client id
    pub fn new(identity: ConnectionIdentity, host: impl Into<String>, port: u16) -> Self {
        Self {
            identity,
            host: host.into(),
            port,
            client_id: String::new(),
            username: None,
            password: None,
            use_tls: false,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    /// Client id to present to the broker
    ///
    /// A blank configured id becomes `mqtt-ingest-{identity}-{uuid}` so two
    /// processes never fight over the same broker session.
    pub fn effective_client_id(&self) -> String {
        if self.client_id.trim().is_empty() {
            format!("mqtt-ingest-{}-{}", self.identity, uuid::Uuid::new_v4().simple())
        } else {
            self.client_id.clone()
        }
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("identity", &self.identity)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

/// One message as received at the transport boundary
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub identity: ConnectionIdentity,
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(identity: ConnectionIdentity, topic: impl Into<String>, payload: Bytes) -> Self {
        Self {
            identity,
            topic: topic.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}
