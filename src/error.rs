//! Error taxonomy for the messaging session core
//!
//! Each caller-facing operation has its own error type so that callers only
//! ever match on failures that operation can actually produce. Transport-level
//! errors are absorbed by the reconnection logic and never reach callers
//! directly; they surface as connection state changes instead.

use crate::config::ConfigError;
use crate::http::HttpError;
use crate::session::state::ConnectionState;
use crate::transport::TransportError;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by `Session::connect`
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectError {
    /// Broker rejected the credentials. Never retried.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Broker could not be reached and automatic reconnection is disabled
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),

    #[error("Session is already active - current state: {state:?}")]
    AlreadyConnected { state: ConnectionState },

    #[error("Session has been closed")]
    SessionClosed,

    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),
}

impl ConnectError {
    /// Whether the failure is caused by the caller's configuration or credentials
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectError::AuthenticationFailed(_) | ConnectError::InvalidConfig(_)
        )
    }
}

impl From<TransportError> for ConnectError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::AuthenticationFailed(reason) => ConnectError::AuthenticationFailed(reason),
            TransportError::InvalidConfiguration(reason) => ConnectError::InvalidConfig(reason),
            TransportError::Timeout(after) => ConnectError::Timeout(after),
            other => ConnectError::Unreachable(other.to_string()),
        }
    }
}

impl From<ConfigError> for ConnectError {
    fn from(error: ConfigError) -> Self {
        ConnectError::InvalidConfig(error.to_string())
    }
}

/// A subscription filter with malformed wildcards or otherwise invalid syntax
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid topic filter '{filter}': {reason}")]
pub struct InvalidTopicFilter {
    pub filter: String,
    pub reason: &'static str,
}

impl InvalidTopicFilter {
    pub fn new<S: Into<String>>(filter: S, reason: &'static str) -> Self {
        Self {
            filter: filter.into(),
            reason,
        }
    }
}

/// Errors resolving a publish request
///
/// Returned either immediately from `Session::publish` or, exactly once, from
/// the request's `DeliveryHandle`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Delivery of packet {packet_id} timed out after {attempts} attempts")]
    DeliveryTimeout { packet_id: u16, attempts: u32 },

    #[error("Invalid publish topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: &'static str },

    #[error("Too many deliveries in flight (limit {limit})")]
    TooManyInFlight { limit: usize },

    #[error("Offline queue is full (limit {limit})")]
    QueueFull { limit: usize },

    #[error("QoS 0 messages are fire-and-forget and cannot be tracked")]
    Untracked,
}

/// Why an inbound payload could not be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    Empty,
    UnsupportedVersion(u8),
    UnknownType(u8),
    Truncated { field: &'static str },
    InvalidUtf8 { field: &'static str },
    InvalidEnum { field: &'static str, value: u8 },
    TrailingBytes(usize),
}

impl std::fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeErrorKind::Empty => write!(f, "empty payload"),
            DecodeErrorKind::UnsupportedVersion(v) => write!(f, "unsupported schema version {v}"),
            DecodeErrorKind::UnknownType(t) => write!(f, "unknown payload type 0x{t:02x}"),
            DecodeErrorKind::Truncated { field } => write!(f, "payload truncated in field '{field}'"),
            DecodeErrorKind::InvalidUtf8 { field } => write!(f, "field '{field}' is not valid UTF-8"),
            DecodeErrorKind::InvalidEnum { field, value } => {
                write!(f, "field '{field}' has invalid value {value}")
            }
            DecodeErrorKind::TrailingBytes(n) => write!(f, "{n} unexpected trailing bytes"),
        }
    }
}

/// Malformed inbound payload; carries the raw bytes for diagnostics
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Failed to decode payload ({} bytes): {kind}", raw.len())]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub raw: Bytes,
}

impl DecodeError {
    pub fn new(kind: DecodeErrorKind, raw: &[u8]) -> Self {
        Self {
            kind,
            raw: Bytes::copy_from_slice(raw),
        }
    }
}

/// Umbrella error for applications driving a session end to end
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Subscribe error: {0}")]
    Subscribe(#[from] InvalidTopicFilter),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_conversion() {
        assert_eq!(
            ConnectError::from(TransportError::AuthenticationFailed("bad password".to_string())),
            ConnectError::AuthenticationFailed("bad password".to_string())
        );
        assert!(matches!(
            ConnectError::from(TransportError::Unreachable("refused".to_string())),
            ConnectError::Unreachable(_)
        ));
        assert!(matches!(
            ConnectError::from(TransportError::InvalidConfiguration("no host".to_string())),
            ConnectError::InvalidConfig(_)
        ));
    }

    #[test]
    fn test_fatal_connect_errors() {
        assert!(ConnectError::AuthenticationFailed("x".to_string()).is_fatal());
        assert!(ConnectError::InvalidConfig("x".to_string()).is_fatal());
        assert!(!ConnectError::Unreachable("x".to_string()).is_fatal());
        assert!(!ConnectError::SessionClosed.is_fatal());
    }

    #[test]
    fn test_decode_error_keeps_raw_bytes() {
        let error = DecodeError::new(DecodeErrorKind::UnsupportedVersion(9), &[9, 1, 2]);
        assert_eq!(error.raw.as_ref(), &[9, 1, 2]);
        let message = error.to_string();
        assert!(message.contains("3 bytes"));
        assert!(message.contains("unsupported schema version 9"));
    }

    #[test]
    fn test_error_display() {
        let errors: Vec<Box<dyn std::error::Error>> = vec![
            Box::new(PublishError::NotConnected),
            Box::new(PublishError::DeliveryTimeout {
                packet_id: 7,
                attempts: 3,
            }),
            Box::new(InvalidTopicFilter::new("a/#/b", "'#' must be the last level")),
            Box::new(ConnectError::AlreadyConnected {
                state: ConnectionState::Connected,
            }),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
