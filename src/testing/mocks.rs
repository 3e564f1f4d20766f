//! Mock implementations for testing
//!
//! [`MockTransport`] is an in-memory [`Transport`] driven by a [`MockBroker`]
//! handle: tests script connect outcomes, inject inbound messages, drop the
//! connection and inspect everything the session put on the wire.
//! [`MockHttpCollaborator`] serves canned HTTP responses.

use crate::config::SessionConfig;
use crate::http::{HttpCollaborator, HttpError, HttpMethod, HttpResponse};
use crate::protocol::QoS;
use crate::transport::{OutboundPublish, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug)]
struct BrokerState {
    online: bool,
    auto_ack: bool,
    connect_delay: Option<Duration>,
    scripted_connects: VecDeque<Result<(), TransportError>>,
    connect_attempts: usize,
    connected: bool,
    events_tx: Option<mpsc::UnboundedSender<TransportEvent>>,
    published: Vec<OutboundPublish>,
    subscriptions: BTreeMap<String, QoS>,
    subscribe_log: Vec<(String, QoS)>,
    unsubscribed: Vec<String>,
    disconnects: usize,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            online: true,
            auto_ack: true,
            connect_delay: None,
            scripted_connects: VecDeque::new(),
            connect_attempts: 0,
            connected: false,
            events_tx: None,
            published: Vec::new(),
            subscriptions: BTreeMap::new(),
            subscribe_log: Vec::new(),
            unsubscribed: Vec::new(),
            disconnects: 0,
        }
    }
}

impl BrokerState {
    fn send(&self, event: TransportEvent) -> bool {
        self.events_tx
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }
}

/// Control handle for the broker behind one or more [`MockTransport`]s
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport connected to this broker
    pub fn transport(&self) -> MockTransport {
        MockTransport {
            broker: self.clone(),
            events_rx: None,
        }
    }

    /// Outcomes for the next connect attempts, consumed in order before the online flag applies
    pub async fn script_connect<I>(&self, outcomes: I)
    where
        I: IntoIterator<Item = Result<(), TransportError>>,
    {
        self.state.lock().await.scripted_connects.extend(outcomes);
    }

    /// While offline, unscripted connects fail with `Unreachable`
    pub async fn set_online(&self, online: bool) {
        self.state.lock().await.online = online;
    }

    /// Acknowledge tracked publishes as soon as they arrive (default on)
    pub async fn set_auto_ack(&self, auto_ack: bool) {
        self.state.lock().await.auto_ack = auto_ack;
    }

    pub async fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().await.connect_delay = Some(delay);
    }

    /// Inject an inbound message; false when no connection is up
    pub async fn deliver<P: Into<Bytes>>(&self, topic: &str, payload: P, qos: QoS) -> bool {
        self.state.lock().await.send(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
            retain: false,
        })
    }

    /// Acknowledge one tracked publish
    pub async fn ack(&self, packet_id: u16) -> bool {
        self.state
            .lock()
            .await
            .send(TransportEvent::Acknowledged { packet_id })
    }

    pub async fn reject_subscription(&self, reason: &str) -> bool {
        self.state.lock().await.send(TransportEvent::SubscribeRejected {
            reason: reason.to_string(),
        })
    }

    /// Sever the current connection as seen by the session
    pub async fn drop_connection(&self, reason: &str) -> bool {
        let mut state = self.state.lock().await;
        let sent = state.send(TransportEvent::ConnectionLost(reason.to_string()));
        state.events_tx = None;
        state.connected = false;
        sent
    }

    pub async fn published(&self) -> Vec<OutboundPublish> {
        self.state.lock().await.published.clone()
    }

    pub async fn published_to(&self, topic: &str) -> Vec<OutboundPublish> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|p| p.message.topic == topic)
            .cloned()
            .collect()
    }

    pub async fn clear_published(&self) {
        self.state.lock().await.published.clear();
    }

    /// Filters currently subscribed on the broker
    pub async fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.state
            .lock()
            .await
            .subscriptions
            .iter()
            .map(|(filter, qos)| (filter.clone(), *qos))
            .collect()
    }

    /// Every SUBSCRIBE the broker received, in order
    pub async fn subscribe_log(&self) -> Vec<(String, QoS)> {
        self.state.lock().await.subscribe_log.clone()
    }

    pub async fn unsubscribed(&self) -> Vec<String> {
        self.state.lock().await.unsubscribed.clone()
    }

    pub async fn connect_attempts(&self) -> usize {
        self.state.lock().await.connect_attempts
    }

    pub async fn disconnects(&self) -> usize {
        self.state.lock().await.disconnects
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    /// Poll until `check` holds or `timeout` passes
    pub async fn wait_for<F, Fut>(&self, timeout: Duration, check: F) -> bool
    where
        F: Fn(MockBroker) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if check(self.clone()).await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// In-memory transport; see [`MockBroker`]
#[derive(Debug)]
pub struct MockTransport {
    broker: MockBroker,
    events_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl MockTransport {
    /// A transport with its own broker handle
    pub fn new() -> (Self, MockBroker) {
        let broker = MockBroker::new();
        (broker.transport(), broker)
    }

    async fn ensure_connected(&self) -> Result<(), TransportError> {
        let state = self.broker.state.lock().await;
        if state.connected && self.events_rx.is_some() {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, _config: &SessionConfig) -> Result<(), TransportError> {
        self.events_rx = None;

        let delay = {
            let mut state = self.broker.state.lock().await;
            state.connect_attempts += 1;
            state.connected = false;
            state.events_tx = None;
            state.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.broker.state.lock().await;
        let outcome = match state.scripted_connects.pop_front() {
            Some(outcome) => outcome,
            None if state.online => Ok(()),
            None => Err(TransportError::Unreachable("mock broker offline".to_string())),
        };
        outcome?;

        let (tx, rx) = mpsc::unbounded_channel();
        state.events_tx = Some(tx);
        state.connected = true;
        self.events_rx = Some(rx);
        Ok(())
    }

    async fn publish(&mut self, publish: OutboundPublish) -> Result<(), TransportError> {
        self.ensure_connected().await?;
        let mut state = self.broker.state.lock().await;

        if state.auto_ack && publish.message.qos.is_tracked() {
            if let Some(packet_id) = publish.packet_id {
                state.send(TransportEvent::Acknowledged { packet_id });
            }
        }
        state.published.push(publish);
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.ensure_connected().await?;
        let mut state = self.broker.state.lock().await;
        state.subscriptions.insert(filter.to_string(), qos);
        state.subscribe_log.push((filter.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        self.ensure_connected().await?;
        let mut state = self.broker.state.lock().await;
        state.subscriptions.remove(filter);
        state.unsubscribed.push(filter.to_string());
        Ok(())
    }

    async fn next_event(&mut self) -> TransportEvent {
        let Some(rx) = self.events_rx.as_mut() else {
            return std::future::pending().await;
        };
        match rx.recv().await {
            Some(event) => event,
            None => {
                self.events_rx = None;
                std::future::pending().await
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.events_rx = None;
        let mut state = self.broker.state.lock().await;
        state.events_tx = None;
        state.connected = false;
        state.disconnects += 1;
        Ok(())
    }
}

/// HTTP collaborator returning canned responses
#[derive(Debug, Clone, Default)]
pub struct MockHttpCollaborator {
    responses: Arc<Mutex<HashMap<(HttpMethod, String), HttpResponse>>>,
    requests: Arc<Mutex<Vec<(HttpMethod, String, Option<Bytes>)>>>,
}

impl MockHttpCollaborator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn respond<P: Into<String>>(&self, method: HttpMethod, path: P, response: HttpResponse) {
        self.responses.lock().await.insert((method, path.into()), response);
    }

    pub async fn requests(&self) -> Vec<(HttpMethod, String, Option<Bytes>)> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl HttpCollaborator for MockHttpCollaborator {
    async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<HttpResponse, HttpError> {
        self.requests
            .lock()
            .await
            .push((method, path.to_string(), body));

        Ok(self
            .responses
            .lock()
            .await
            .get(&(method, path.to_string()))
            .cloned()
            .unwrap_or_else(|| HttpResponse::new(404, Bytes::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;

    fn config() -> SessionConfig {
        SessionConfig::new("mqtt://localhost:1883", "mock-test")
    }

    #[tokio::test]
    async fn test_scripted_connects_then_online_flag() {
        let (mut transport, broker) = MockTransport::new();
        broker
            .script_connect([Err(TransportError::Unreachable("down".to_string()))])
            .await;

        assert!(transport.connect(&config()).await.is_err());
        assert!(transport.connect(&config()).await.is_ok());
        assert!(broker.is_connected().await);

        broker.set_online(false).await;
        assert!(transport.connect(&config()).await.is_err());
        assert_eq!(broker.connect_attempts().await, 3);
    }

    #[tokio::test]
    async fn test_auto_ack_and_delivery() {
        let (mut transport, broker) = MockTransport::new();
        transport.connect(&config()).await.unwrap();

        let publish = OutboundPublish {
            packet_id: Some(7),
            message: Message::new("device/a/cmd", "x", QoS::AtLeastOnce, false),
            dup: false,
        };
        transport.publish(publish).await.unwrap();
        assert_eq!(
            transport.next_event().await,
            TransportEvent::Acknowledged { packet_id: 7 }
        );

        assert!(broker.deliver("device/a/status", "y", QoS::AtMostOnce).await);
        assert!(matches!(
            transport.next_event().await,
            TransportEvent::Message { .. }
        ));
        assert_eq!(broker.published_to("device/a/cmd").await.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_connection_rejects_publishes() {
        let (mut transport, broker) = MockTransport::new();
        transport.connect(&config()).await.unwrap();
        assert!(broker.drop_connection("reset").await);

        assert_eq!(
            transport.next_event().await,
            TransportEvent::ConnectionLost("reset".to_string())
        );
        let publish = OutboundPublish {
            packet_id: None,
            message: Message::new("device/a/cmd", "x", QoS::AtMostOnce, false),
            dup: false,
        };
        assert_eq!(
            transport.publish(publish).await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_mock_http_collaborator() {
        let http = MockHttpCollaborator::new();
        http.respond(
            HttpMethod::Get,
            "/devices",
            HttpResponse::new(200, Bytes::from_static(b"[]")),
        )
        .await;

        let ok = http.request(HttpMethod::Get, "/devices", None).await.unwrap();
        assert!(ok.is_success());
        let missing = http.request(HttpMethod::Post, "/devices", None).await.unwrap();
        assert_eq!(missing.status, 404);
        assert_eq!(http.requests().await.len(), 2);
    }
}
