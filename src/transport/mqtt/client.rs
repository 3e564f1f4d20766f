//! rumqttc-backed [`Transport`]
//!
//! Each `connect` builds a fresh `AsyncClient`/`EventLoop` pair and spawns a
//! poll task that translates rumqttc events into [`TransportEvent`]s.
//! rumqttc never reconnects on its own here: the first event loop error ends
//! the poll task and the session core decides what happens next.
//!
//! rumqttc assigns its own packet ids. The client records the session's
//! packet id for every publish in a FIFO; the poll task pairs it with the
//! rumqttc pkid when the publish goes out, and maps the broker's PUBACK or
//! PUBCOMP back to the session's id.

use crate::config::SessionConfig;
use crate::protocol::QoS;
use crate::transport::mqtt::connection::{
    classify_connection_error, configure_mqtt_options, to_mqtt_qos,
};
use crate::transport::mqtt::message_handler::{EventRoute, MessageHandler};
use crate::transport::{OutboundPublish, Transport, TransportError, TransportEvent};
use rumqttc::v5::{AsyncClient, EventLoop};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Requests rumqttc buffers between the client and its event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Session packet ids in the order their publishes were handed to rumqttc
type DispatchQueue = Arc<Mutex<VecDeque<Option<u16>>>>;

type ConnAckSender = oneshot::Sender<Result<(), TransportError>>;

#[derive(Default)]
pub struct MqttTransport {
    client: Option<AsyncClient>,
    events_rx: Option<mpsc::Receiver<TransportEvent>>,
    poll_handle: Option<JoinHandle<()>>,
    dispatch: DispatchQueue,
    loss_reported: bool,
}

impl MqttTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.poll_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.client.as_ref().ok_or(TransportError::NotConnected)
    }

    /// Drop the current connection without a DISCONNECT
    fn abandon(&mut self) {
        if let Some(handle) = self.poll_handle.take() {
            handle.abort();
        }
        self.client = None;
        self.events_rx = None;
    }

    async fn run_event_loop(
        mut eventloop: EventLoop,
        events_tx: mpsc::Sender<TransportEvent>,
        dispatch: DispatchQueue,
        connack_tx: ConnAckSender,
    ) {
        let mut connack_tx = Some(connack_tx);
        // rumqttc pkid -> session packet id
        let mut in_flight: HashMap<u16, u16> = HashMap::new();

        loop {
            let event = match eventloop.poll().await {
                Ok(event) => event,
                Err(e) => {
                    let classified = classify_connection_error(&e);
                    match connack_tx.take() {
                        Some(tx) => {
                            let _ = tx.send(Err(classified));
                        }
                        None => {
                            error!(error = %e, "MQTT event loop error");
                            let _ = events_tx
                                .send(TransportEvent::ConnectionLost(classified.to_string()))
                                .await;
                        }
                    }
                    break;
                }
            };

            let forward = match MessageHandler::route_mqtt_event(&event) {
                EventRoute::ConnectionAcknowledged => {
                    if let Some(tx) = connack_tx.take() {
                        let _ = tx.send(Ok(()));
                    }
                    None
                }
                EventRoute::MessageReceived {
                    topic,
                    payload,
                    qos,
                    retain,
                } => Some(TransportEvent::Message {
                    topic,
                    payload,
                    qos,
                    retain,
                }),
                EventRoute::PublishDispatched { pkid } => {
                    let ours = dispatch.lock().await.pop_front().flatten();
                    match ours {
                        Some(packet_id) if pkid != 0 => {
                            in_flight.insert(pkid, packet_id);
                        }
                        Some(packet_id) => {
                            warn!(packet_id, "Tracked publish went out without a packet id");
                        }
                        None => {}
                    }
                    None
                }
                EventRoute::PublishAcknowledged { pkid } => in_flight
                    .remove(&pkid)
                    .map(|packet_id| TransportEvent::Acknowledged { packet_id }),
                EventRoute::SubscriptionConfirmed { pkid, rejected } if rejected > 0 => {
                    Some(TransportEvent::SubscribeRejected {
                        reason: format!("broker rejected {rejected} filter(s) in SUBACK {pkid}"),
                    })
                }
                EventRoute::SubscriptionConfirmed { pkid, .. } => {
                    debug!(pkid, "Subscription confirmed");
                    None
                }
                EventRoute::Disconnected(reason) => {
                    let _ = events_tx
                        .send(TransportEvent::ConnectionLost(format!(
                            "broker sent DISCONNECT: {reason}"
                        )))
                        .await;
                    break;
                }
                EventRoute::InfrastructureEvent(event) => {
                    debug!(target: "mqtt_transport", "MQTT event: {}", event);
                    None
                }
                EventRoute::OutgoingEvent => None,
            };

            if let Some(event) = forward {
                if events_tx.send(event).await.is_err() {
                    break;
                }
            }
        }

        debug!("MQTT event loop stopped");
    }
}

/// Whether `publish` may go out as a new PUBLISH packet
///
/// `AsyncClient` can't set DUP or reuse a packet id, so a retransmitted
/// QoS 2 publish would reach the broker as a second message.
fn reissues_safely(publish: &OutboundPublish) -> bool {
    !(publish.dup && publish.message.qos == QoS::ExactlyOnce)
}

#[async_trait::async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self, config: &SessionConfig) -> Result<(), TransportError> {
        self.abandon();

        let options = configure_mqtt_options(config)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (connack_tx, connack_rx) = oneshot::channel();
        self.dispatch = Arc::new(Mutex::new(VecDeque::new()));

        info!(broker = %config.broker_url, client_id = %config.client_id, "Connecting to MQTT broker");
        let span = crate::mqtt_span!(broker = %config.broker_url);
        self.poll_handle = Some(tokio::spawn(
            Self::run_event_loop(eventloop, events_tx, Arc::clone(&self.dispatch), connack_tx)
                .instrument(span),
        ));
        self.client = Some(client);
        self.events_rx = Some(events_rx);
        self.loss_reported = false;

        let timeout = config.connect_timeout();
        let result = match tokio::time::timeout(timeout, connack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Unreachable(
                "event loop stopped before CONNACK".to_string(),
            )),
            Err(_) => Err(TransportError::Timeout(timeout)),
        };

        if let Err(e) = &result {
            warn!(error = %e, "MQTT connect attempt failed");
            self.abandon();
        }
        result
    }

    async fn publish(&mut self, publish: OutboundPublish) -> Result<(), TransportError> {
        let client = self.client()?.clone();
        if !reissues_safely(&publish) {
            warn!(
                packet_id = ?publish.packet_id,
                topic = %publish.message.topic,
                "Not re-issuing QoS 2 publish; it completes on PUBCOMP or times out"
            );
            return Ok(());
        }

        let OutboundPublish {
            packet_id, message, ..
        } = publish;

        let dispatch_id = packet_id.filter(|_| message.qos.is_tracked());
        self.dispatch.lock().await.push_back(dispatch_id);

        let result = client
            .publish(
                message.topic,
                to_mqtt_qos(message.qos),
                message.retain,
                message.payload,
            )
            .await;

        if let Err(e) = result {
            self.dispatch.lock().await.pop_back();
            return Err(TransportError::ConnectionLost(e.to_string()));
        }
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.client()?
            .subscribe(filter, to_mqtt_qos(qos))
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))
    }

    async fn unsubscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        self.client()?
            .unsubscribe(filter)
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))
    }

    async fn next_event(&mut self) -> TransportEvent {
        let Some(rx) = self.events_rx.as_mut() else {
            return std::future::pending().await;
        };

        match rx.recv().await {
            Some(event) => {
                if matches!(event, TransportEvent::ConnectionLost(_)) {
                    self.loss_reported = true;
                }
                event
            }
            None => {
                self.events_rx = None;
                if self.loss_reported {
                    std::future::pending().await
                } else {
                    self.loss_reported = true;
                    TransportEvent::ConnectionLost("MQTT event loop stopped".to_string())
                }
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(client) = self.client.take() {
            // The event loop may already be gone; nothing left to tell the broker then
            if let Err(e) = client.disconnect().await {
                debug!(error = %e, "DISCONNECT not sent");
            }
        }

        if let Some(mut handle) = self.poll_handle.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
                Ok(Ok(())) => info!("MQTT event loop shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!(error = %e, "MQTT event loop ended with error");
                }
                Err(_) => {
                    warn!("MQTT event loop didn't shut down gracefully, aborting");
                    handle.abort();
                }
                _ => {}
            }
        }

        self.events_rx = None;
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.poll_handle.take() {
            handle.abort();
        }
    }
}
