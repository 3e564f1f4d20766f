//! Events surfaced to session observers

use crate::error::DecodeError;
use crate::protocol::{DevicePayload, QoS};
use crate::session::state::ConnectionState;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// A decoded message that matched at least one subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: DevicePayload,
}

impl InboundMessage {
    pub fn correlation_id(&self) -> Option<Uuid> {
        self.payload.correlation_id()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Message(InboundMessage),
    /// Payload on a subscribed topic that failed to decode
    Malformed { topic: String, error: DecodeError },
    /// Message on a topic no subscription matches
    Unhandled { topic: String },
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Connection gave up for good (authentication failure or retries exhausted)
    ConnectionFailed { reason: String },
}

impl InboundEvent {
    pub fn topic(&self) -> Option<&str> {
        match self {
            InboundEvent::Message(message) => Some(&message.topic),
            InboundEvent::Malformed { topic, .. } | InboundEvent::Unhandled { topic } => Some(topic),
            _ => None,
        }
    }
}

/// Lazy, unbounded sequence of session events starting from subscription time
///
/// Slow consumers skip ahead rather than block the session; skipped events
/// are logged.
pub struct EventStream {
    rx: broadcast::Receiver<InboundEvent>,
}

impl EventStream {
    pub(crate) fn new(rx: broadcast::Receiver<InboundEvent>) -> Self {
        Self { rx }
    }

    /// Next event; None only once the session itself is gone
    pub async fn next(&mut self) -> Option<InboundEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event consumer lagging, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already buffered
    pub fn try_next(&mut self) -> Option<InboundEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event consumer lagging, events dropped");
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_skips_lagged_events() {
        let (tx, rx) = broadcast::channel(2);
        let mut stream = EventStream::new(rx);

        for topic in ["a", "b", "c"] {
            tx.send(InboundEvent::Unhandled {
                topic: topic.to_string(),
            })
            .unwrap();
        }

        let first = stream.next().await.unwrap();
        assert_eq!(first.topic(), Some("b"));
        assert_eq!(stream.try_next().unwrap().topic(), Some("c"));
        assert!(stream.try_next().is_none());

        drop(tx);
        assert!(stream.next().await.is_none());
    }
}
