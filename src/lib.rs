//! devlink - MQTT messaging session core for remote media devices
//!
//! A [`Session`] keeps one broker connection alive on behalf of an
//! application: it reconnects with backoff, restores subscriptions, tracks
//! QoS 1/2 publishes until the broker acknowledges them and routes decoded
//! device payloads to subscribers.
//!
//! # Quick Start
//!
//! ```rust
//! use devlink::protocol::{codec, DevicePayload, TopicBuilder};
//!
//! let command = DevicePayload::invoke("screenshot", Vec::<u8>::new());
//! let topic = TopicBuilder::command_topic("frame-01");
//! let wire = codec::encode(&command);
//!
//! assert_eq!(topic, "device/frame-01/cmd");
//! assert_eq!(codec::decode(&wire).unwrap(), command);
//! ```
//!
//! Sessions run against any [`Transport`]; [`MqttTransport`] talks to a real
//! broker and [`testing::MockTransport`] stays in memory.

pub mod config;
pub mod error;
pub mod http;
pub mod observability;
pub mod protocol;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::{DevlinkConfig, SessionConfig};
pub use error::{ConnectError, DecodeError, InvalidTopicFilter, PublishError, SessionError};
pub use http::{HttpCollaborator, HttpMethod, HttpResponse, ReqwestCollaborator};
pub use protocol::{DevicePayload, Message, QoS, TopicBuilder};
pub use session::{
    ConnectionState, DeliveryHandle, EventStream, InboundEvent, InboundMessage, Session,
    SubscriptionHandle,
};
pub use transport::{MqttTransport, Transport, TransportError};
