//! Pure routing decisions for rumqttc events

use crate::protocol::QoS;
use crate::transport::mqtt::connection::from_mqtt_qos;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
use rumqttc::v5::Event;
use rumqttc::Outgoing;

pub struct MessageHandler;

impl MessageHandler {
    /// Route an event loop event to the action the transport takes for it
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    qos: from_mqtt_qos(publish.qos),
                    retain: publish.retain,
                },
                Packet::PubAck(ack) => EventRoute::PublishAcknowledged { pkid: ack.pkid },
                Packet::PubComp(comp) => EventRoute::PublishAcknowledged { pkid: comp.pkid },
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    pkid: suback.pkid,
                    rejected: Self::rejected_subscriptions(&suback.return_codes),
                },
                Packet::Disconnect(disconnect) => {
                    EventRoute::Disconnected(format!("{:?}", disconnect.reason_code))
                }
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Publish(pkid)) => EventRoute::PublishDispatched { pkid: *pkid },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Number of filters the broker refused in one SUBACK
    pub fn rejected_subscriptions(return_codes: &[SubscribeReasonCode]) -> usize {
        return_codes
            .iter()
            .filter(|code| !matches!(code, SubscribeReasonCode::Success(_)))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    /// A publish left the client; QoS 0 publishes report pkid 0
    PublishDispatched { pkid: u16 },
    /// PUBACK for QoS 1 or PUBCOMP for QoS 2
    PublishAcknowledged { pkid: u16 },
    SubscriptionConfirmed { pkid: u16, rejected: usize },
    /// Broker sent DISCONNECT
    Disconnected(String),
    /// PingResp, PubRec and friends
    InfrastructureEvent(String),
    OutgoingEvent,
}
