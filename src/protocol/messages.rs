//! Message and payload types exchanged with devices
//!
//! `Message` is what travels over the broker; `DevicePayload` is the typed
//! content of a message body once decoded by the codec.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn level(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }

    /// Whether deliveries at this level need acknowledgment tracking
    pub fn is_tracked(self) -> bool {
        self != QoS::AtMostOnce
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Invalid QoS level: {0}")]
pub struct InvalidQos(pub u8);

impl TryFrom<u8> for QoS {
    type Error = InvalidQos;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(InvalidQos(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos.level()
    }
}

/// An outbound or inbound broker message
///
/// # Examples
/// ```
/// use devlink::protocol::{Message, QoS};
///
/// let message = Message::new("device/frame-01/cmd", "hello", QoS::AtLeastOnce, false);
/// assert_eq!(message.payload.as_ref(), b"hello");
/// assert!(message.correlation_id.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Matches a command to its acknowledgment telemetry
    pub correlation_id: Option<Uuid>,
}

impl Message {
    pub fn new<T, P>(topic: T, payload: P, qos: QoS, retain: bool) -> Self
    where
        T: Into<String>,
        P: Into<Bytes>,
    {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Kind of content pushed to a display device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Image,
    Video,
    Text,
    Webpage,
}

/// Result reported by a device for a command or content push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckOutcome {
    Success,
    Failed,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastLevel {
    Info,
    Warning,
    Critical,
}

/// Typed message body
///
/// Outbound variants are commands and presence sent by this side; inbound
/// variants are telemetry and acknowledgments sent by devices. Both decode
/// through the same tagged schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevicePayload {
    /// Invoke a named operation on the device (`screenshot`, `restart`, `get_status`, ...)
    Invoke {
        correlation_id: Uuid,
        name: String,
        args: Bytes,
    },
    ContentPush {
        correlation_id: Uuid,
        content_id: String,
        kind: ContentKind,
        url: String,
        duration_secs: u32,
    },
    Register {
        device_id: String,
        name: String,
        capabilities: Vec<String>,
    },
    Heartbeat {
        timestamp_ms: i64,
        uptime_secs: u64,
    },
    Status {
        online: bool,
        detail: Option<String>,
    },
    Telemetry {
        kind: String,
        value: i64,
    },
    Ack {
        correlation_id: Uuid,
        outcome: AckOutcome,
        detail: Option<String>,
    },
    ContentResponse {
        content_id: String,
        outcome: AckOutcome,
        error: Option<String>,
    },
    Broadcast {
        level: BroadcastLevel,
        message: String,
    },
}

impl DevicePayload {
    /// Build an `Invoke` command with a fresh correlation id
    pub fn invoke<N: Into<String>, A: Into<Bytes>>(name: N, args: A) -> Self {
        DevicePayload::Invoke {
            correlation_id: Uuid::new_v4(),
            name: name.into(),
            args: args.into(),
        }
    }

    pub fn content_push<C: Into<String>, U: Into<String>>(
        content_id: C,
        kind: ContentKind,
        url: U,
        duration_secs: u32,
    ) -> Self {
        DevicePayload::ContentPush {
            correlation_id: Uuid::new_v4(),
            content_id: content_id.into(),
            kind,
            url: url.into(),
            duration_secs,
        }
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        match self {
            DevicePayload::Invoke { correlation_id, .. }
            | DevicePayload::ContentPush { correlation_id, .. }
            | DevicePayload::Ack { correlation_id, .. } => Some(*correlation_id),
            _ => None,
        }
    }

    /// Short variant name used in logs
    pub fn kind_name(&self) -> &'static str {
        match self {
            DevicePayload::Invoke { .. } => "invoke",
            DevicePayload::ContentPush { .. } => "content_push",
            DevicePayload::Register { .. } => "register",
            DevicePayload::Heartbeat { .. } => "heartbeat",
            DevicePayload::Status { .. } => "status",
            DevicePayload::Telemetry { .. } => "telemetry",
            DevicePayload::Ack { .. } => "ack",
            DevicePayload::ContentResponse { .. } => "content_response",
            DevicePayload::Broadcast { .. } => "broadcast",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_conversion() {
        assert_eq!(QoS::try_from(0), Ok(QoS::AtMostOnce));
        assert_eq!(QoS::try_from(1), Ok(QoS::AtLeastOnce));
        assert_eq!(QoS::try_from(2), Ok(QoS::ExactlyOnce));
        assert_eq!(QoS::try_from(3), Err(InvalidQos(3)));
        assert_eq!(u8::from(QoS::ExactlyOnce), 2);
    }

    #[test]
    fn test_qos_tracking_and_ordering() {
        assert!(!QoS::AtMostOnce.is_tracked());
        assert!(QoS::AtLeastOnce.is_tracked());
        assert!(QoS::ExactlyOnce.is_tracked());
        assert!(QoS::AtMostOnce < QoS::ExactlyOnce);
        assert_eq!(QoS::AtLeastOnce.max(QoS::ExactlyOnce), QoS::ExactlyOnce);
    }

    #[test]
    fn test_qos_deserializes_from_level() {
        #[derive(Deserialize)]
        struct Wrapper {
            qos: QoS,
        }

        let parsed: Wrapper = toml::from_str("qos = 1").unwrap();
        assert_eq!(parsed.qos, QoS::AtLeastOnce);
        assert!(toml::from_str::<Wrapper>("qos = 5").is_err());
    }

    #[test]
    fn test_correlation_ids() {
        let invoke = DevicePayload::invoke("screenshot", Bytes::new());
        assert!(invoke.correlation_id().is_some());

        let other = DevicePayload::invoke("screenshot", Bytes::new());
        assert_ne!(invoke.correlation_id(), other.correlation_id());

        let telemetry = DevicePayload::Telemetry {
            kind: "temperature".to_string(),
            value: 21,
        };
        assert_eq!(telemetry.correlation_id(), None);
        assert_eq!(telemetry.kind_name(), "telemetry");
    }

    #[test]
    fn test_message_builder() {
        let id = Uuid::new_v4();
        let message =
            Message::new("device/a/cmd", vec![1u8, 2, 3], QoS::AtMostOnce, true).with_correlation_id(id);
        assert_eq!(message.topic, "device/a/cmd");
        assert_eq!(message.payload.len(), 3);
        assert!(message.retain);
        assert_eq!(message.correlation_id, Some(id));
    }
}
