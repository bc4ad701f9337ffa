//! Error taxonomy for the ingestion service
//!
//! Transport, store and configuration layers each have their own error enum;
//! [`IngestError`] is what caller-facing operations return. Connect failures
//! are not errors at this level: they surface as `false` plus a sanitised
//! last-error string on the connection status.

use crate::config::ConfigError;
use crate::store::StoreError;
use crate::supervisor::ConnectionState;
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for caller-facing operations
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid connection identity: {0:?}")]
    InvalidIdentity(String),

    #[error("Invalid topic filter {filter:?}: {reason}")]
    InvalidTopicFilter { filter: String, reason: String },

    #[error("Connection '{0}' not found")]
    UnknownConnection(String),

    #[error("Connection '{identity}' is not connected (state: {state})")]
    NotConnected {
        identity: String,
        state: ConnectionState,
    },

    #[error("Transport error on '{identity}': {source}")]
    Transport {
        identity: String,
        #[source]
        source: TransportError,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl IngestError {
    pub fn invalid_topic_filter<F: Into<String>, R: Into<String>>(filter: F, reason: R) -> Self {
        Self::InvalidTopicFilter {
            filter: filter.into(),
            reason: reason.into(),
        }
    }

    pub fn transport<I: Into<String>>(identity: I, source: TransportError) -> Self {
        Self::Transport {
            identity: identity.into(),
            source,
        }
    }

    /// True for errors caused by asking about a connection that has no live client
    pub fn is_not_connected(&self) -> bool {
        matches!(
            self,
            IngestError::UnknownConnection(_) | IngestError::NotConnected { .. }
        )
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+").expect("static regex")
});

static URL_CREDENTIALS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)([a-z][a-z0-9+.-]*://)[^/\s:@]+:[^/\s@]+@").expect("static regex"));

const MAX_ERROR_LEN: usize = 500;

/// Redact credentials and bound the length of an error string before it is
/// stored as a connection's last error or returned across the API boundary
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = URL_CREDENTIALS_PATTERN
        .replace_all(&sanitized, "${1}***@")
        .to_string();

    if sanitized.len() > MAX_ERROR_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_ERROR_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for caller-facing operations
pub type IngestResult<T> = Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = IngestError::UnknownConnection("b1".to_string());
        assert_eq!(error.to_string(), "Connection 'b1' not found");

        let error = IngestError::NotConnected {
            identity: "b1".to_string(),
            state: ConnectionState::Error,
        };
        assert!(error.to_string().contains("Error"));
        assert!(error.is_not_connected());

        let error = IngestError::invalid_topic_filter("a/#/b", "'#' must be last");
        assert!(error.to_string().contains("a/#/b"));
        assert!(!error.is_not_connected());
    }

    #[test]
    fn test_transport_error_keeps_source() {
        let error = IngestError::transport("b1", TransportError::Timeout("connect".to_string()));
        let source = std::error::Error::source(&error).expect("source should be set");
        assert!(source.to_string().contains("connect"));
    }

    #[test]
    fn test_sanitize_redacts_secrets() {
        let sanitized = sanitize_error_message("auth failed: password=secret123 token: abc456");
        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("abc456"));
        assert!(sanitized.contains("password=***"));
        assert!(sanitized.contains("token=***"));
    }

    #[test]
    fn test_sanitize_redacts_url_credentials() {
        let sanitized = sanitize_error_message("cannot reach mqtts://alice:pw@broker:8883");
        assert!(!sanitized.contains("alice:pw"));
        assert!(sanitized.contains("mqtts://***@broker:8883"));
    }

    #[test]
    fn test_long_message_truncation() {
        let sanitized = sanitize_error_message(&"x".repeat(600));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));

        let exact = sanitize_error_message(&"x".repeat(500));
        assert_eq!(exact.len(), 500);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitized = sanitize_error_message(&"温度".repeat(200));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_sanitize_empty_message() {
        assert_eq!(sanitize_error_message(""), "");
    }
}
