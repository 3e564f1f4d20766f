//! Transport layer between the session core and the broker
//!
//! The session core drives a [`Transport`] from a single supervisor task, so
//! implementations need `&mut self` access only and never have to be `Sync`.
//! [`mqtt::MqttTransport`] is the production implementation;
//! `testing::MockTransport` is a scriptable in-memory one.

use crate::config::SessionConfig;
use crate::protocol::{Message, QoS};
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

pub mod mqtt;

pub use mqtt::MqttTransport;

/// Outbound publish as handed to the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPublish {
    /// Tracking id; None for QoS 0
    pub packet_id: Option<u16>,
    pub message: Message,
    /// Set when this is a retransmission
    pub dup: bool,
}

/// Something the broker connection produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    /// Final acknowledgment (PUBACK or PUBCOMP) for a tracked publish
    Acknowledged { packet_id: u16 },
    SubscribeRejected { reason: String },
    ConnectionLost(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Broker unreachable: {0}")]
    Unreachable(String),
    #[error("Invalid transport configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Not connected")]
    NotConnected,
}

impl TransportError {
    /// Failures that no amount of retrying will fix
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::AuthenticationFailed(_) | TransportError::InvalidConfiguration(_)
        )
    }
}

/// Broker connection consumed by the session core
#[async_trait::async_trait]
pub trait Transport: Send + 'static {
    /// Open a fresh connection; resolves once the broker acknowledged it
    async fn connect(&mut self, config: &SessionConfig) -> Result<(), TransportError>;

    async fn publish(&mut self, publish: OutboundPublish) -> Result<(), TransportError>;

    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), TransportError>;

    async fn unsubscribe(&mut self, filter: &str) -> Result<(), TransportError>;

    /// Next inbound event. Must be cancel safe; pends forever while disconnected.
    async fn next_event(&mut self) -> TransportEvent;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}
