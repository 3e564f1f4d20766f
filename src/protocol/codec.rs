//! Versioned binary codec for device payloads
//!
//! Layout: schema version byte, payload type byte, then type-specific fields.
//! Strings and blobs are u32 big-endian length-prefixed, UUIDs are 16 raw
//! bytes, integers are big-endian, optional fields carry a presence byte.
//! Anything left over after the last field is malformed.

use crate::error::{DecodeError, DecodeErrorKind};
use crate::protocol::messages::{AckOutcome, BroadcastLevel, ContentKind, DevicePayload};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

pub const SCHEMA_VERSION: u8 = 0x01;

pub const TYPE_INVOKE: u8 = 0x01;
pub const TYPE_CONTENT_PUSH: u8 = 0x02;
pub const TYPE_REGISTER: u8 = 0x03;
pub const TYPE_HEARTBEAT: u8 = 0x04;
pub const TYPE_STATUS: u8 = 0x05;
pub const TYPE_TELEMETRY: u8 = 0x81;
pub const TYPE_ACK: u8 = 0x82;
pub const TYPE_CONTENT_RESPONSE: u8 = 0x83;
pub const TYPE_BROADCAST: u8 = 0x84;

pub fn type_id(payload: &DevicePayload) -> u8 {
    match payload {
        DevicePayload::Invoke { .. } => TYPE_INVOKE,
        DevicePayload::ContentPush { .. } => TYPE_CONTENT_PUSH,
        DevicePayload::Register { .. } => TYPE_REGISTER,
        DevicePayload::Heartbeat { .. } => TYPE_HEARTBEAT,
        DevicePayload::Status { .. } => TYPE_STATUS,
        DevicePayload::Telemetry { .. } => TYPE_TELEMETRY,
        DevicePayload::Ack { .. } => TYPE_ACK,
        DevicePayload::ContentResponse { .. } => TYPE_CONTENT_RESPONSE,
        DevicePayload::Broadcast { .. } => TYPE_BROADCAST,
    }
}

pub fn encode(payload: &DevicePayload) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(SCHEMA_VERSION);
    buf.put_u8(type_id(payload));

    match payload {
        DevicePayload::Invoke {
            correlation_id,
            name,
            args,
        } => {
            put_uuid(&mut buf, correlation_id);
            put_str(&mut buf, name);
            put_blob(&mut buf, args);
        }
        DevicePayload::ContentPush {
            correlation_id,
            content_id,
            kind,
            url,
            duration_secs,
        } => {
            put_uuid(&mut buf, correlation_id);
            put_str(&mut buf, content_id);
            buf.put_u8(content_kind_code(*kind));
            put_str(&mut buf, url);
            buf.put_u32(*duration_secs);
        }
        DevicePayload::Register {
            device_id,
            name,
            capabilities,
        } => {
            put_str(&mut buf, device_id);
            put_str(&mut buf, name);
            put_len(&mut buf, capabilities.len());
            for capability in capabilities {
                put_str(&mut buf, capability);
            }
        }
        DevicePayload::Heartbeat {
            timestamp_ms,
            uptime_secs,
        } => {
            buf.put_i64(*timestamp_ms);
            buf.put_u64(*uptime_secs);
        }
        DevicePayload::Status { online, detail } => {
            buf.put_u8(u8::from(*online));
            put_opt_str(&mut buf, detail.as_deref());
        }
        DevicePayload::Telemetry { kind, value } => {
            put_str(&mut buf, kind);
            buf.put_i64(*value);
        }
        DevicePayload::Ack {
            correlation_id,
            outcome,
            detail,
        } => {
            put_uuid(&mut buf, correlation_id);
            buf.put_u8(outcome_code(*outcome));
            put_opt_str(&mut buf, detail.as_deref());
        }
        DevicePayload::ContentResponse {
            content_id,
            outcome,
            error,
        } => {
            put_str(&mut buf, content_id);
            buf.put_u8(outcome_code(*outcome));
            put_opt_str(&mut buf, error.as_deref());
        }
        DevicePayload::Broadcast { level, message } => {
            buf.put_u8(broadcast_level_code(*level));
            put_str(&mut buf, message);
        }
    }

    buf.freeze()
}

pub fn decode(raw: &[u8]) -> Result<DevicePayload, DecodeError> {
    let mut reader = Reader { buf: raw };
    decode_fields(&mut reader).map_err(|kind| DecodeError::new(kind, raw))
}

fn decode_fields(reader: &mut Reader<'_>) -> Result<DevicePayload, DecodeErrorKind> {
    if reader.buf.is_empty() {
        return Err(DecodeErrorKind::Empty);
    }

    let version = reader.u8("version")?;
    if version != SCHEMA_VERSION {
        return Err(DecodeErrorKind::UnsupportedVersion(version));
    }

    let payload = match reader.u8("type")? {
        TYPE_INVOKE => DevicePayload::Invoke {
            correlation_id: reader.uuid("correlation_id")?,
            name: reader.string("name")?,
            args: reader.blob("args")?,
        },
        TYPE_CONTENT_PUSH => DevicePayload::ContentPush {
            correlation_id: reader.uuid("correlation_id")?,
            content_id: reader.string("content_id")?,
            kind: content_kind_from(reader.u8("kind")?)?,
            url: reader.string("url")?,
            duration_secs: reader.u32("duration_secs")?,
        },
        TYPE_REGISTER => {
            let device_id = reader.string("device_id")?;
            let name = reader.string("name")?;
            let count = reader.u32("capabilities")? as usize;
            // Each entry needs at least its length prefix
            if count > reader.buf.len() / 4 {
                return Err(DecodeErrorKind::Truncated {
                    field: "capabilities",
                });
            }
            let mut capabilities = Vec::with_capacity(count);
            for _ in 0..count {
                capabilities.push(reader.string("capability")?);
            }
            DevicePayload::Register {
                device_id,
                name,
                capabilities,
            }
        }
        TYPE_HEARTBEAT => DevicePayload::Heartbeat {
            timestamp_ms: reader.i64("timestamp_ms")?,
            uptime_secs: reader.u64("uptime_secs")?,
        },
        TYPE_STATUS => DevicePayload::Status {
            online: reader.flag("online")?,
            detail: reader.opt_string("detail")?,
        },
        TYPE_TELEMETRY => DevicePayload::Telemetry {
            kind: reader.string("kind")?,
            value: reader.i64("value")?,
        },
        TYPE_ACK => DevicePayload::Ack {
            correlation_id: reader.uuid("correlation_id")?,
            outcome: outcome_from(reader.u8("outcome")?)?,
            detail: reader.opt_string("detail")?,
        },
        TYPE_CONTENT_RESPONSE => DevicePayload::ContentResponse {
            content_id: reader.string("content_id")?,
            outcome: outcome_from(reader.u8("outcome")?)?,
            error: reader.opt_string("error")?,
        },
        TYPE_BROADCAST => DevicePayload::Broadcast {
            level: broadcast_level_from(reader.u8("level")?)?,
            message: reader.string("message")?,
        },
        unknown => return Err(DecodeErrorKind::UnknownType(unknown)),
    };

    if !reader.buf.is_empty() {
        return Err(DecodeErrorKind::TrailingBytes(reader.buf.len()));
    }

    Ok(payload)
}

fn put_len(buf: &mut BytesMut, len: usize) {
    // In-memory values never exceed u32::MAX on the platforms we target
    buf.put_u32(u32::try_from(len).unwrap_or(u32::MAX));
}

fn put_blob(buf: &mut BytesMut, bytes: &[u8]) {
    put_len(buf, bytes.len());
    buf.put_slice(bytes);
}

fn put_str(buf: &mut BytesMut, value: &str) {
    put_blob(buf, value.as_bytes());
}

fn put_opt_str(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(value) => {
            buf.put_u8(1);
            put_str(buf, value);
        }
        None => buf.put_u8(0),
    }
}

fn put_uuid(buf: &mut BytesMut, id: &Uuid) {
    buf.put_slice(id.as_bytes());
}

/// Bounds-checked cursor; every read reports the field it was decoding
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn need(&self, len: usize, field: &'static str) -> Result<(), DecodeErrorKind> {
        if self.buf.remaining() < len {
            Err(DecodeErrorKind::Truncated { field })
        } else {
            Ok(())
        }
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, DecodeErrorKind> {
        self.need(1, field)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, DecodeErrorKind> {
        self.need(4, field)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, DecodeErrorKind> {
        self.need(8, field)?;
        Ok(self.buf.get_u64())
    }

    fn i64(&mut self, field: &'static str) -> Result<i64, DecodeErrorKind> {
        self.need(8, field)?;
        Ok(self.buf.get_i64())
    }

    fn flag(&mut self, field: &'static str) -> Result<bool, DecodeErrorKind> {
        match self.u8(field)? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(DecodeErrorKind::InvalidEnum { field, value }),
        }
    }

    fn uuid(&mut self, field: &'static str) -> Result<Uuid, DecodeErrorKind> {
        self.need(16, field)?;
        let (bytes, rest) = self.buf.split_at(16);
        self.buf = rest;
        Uuid::from_slice(bytes).map_err(|_| DecodeErrorKind::Truncated { field })
    }

    fn slice(&mut self, field: &'static str) -> Result<&'a [u8], DecodeErrorKind> {
        let len = self.u32(field)? as usize;
        self.need(len, field)?;
        let (bytes, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(bytes)
    }

    fn blob(&mut self, field: &'static str) -> Result<Bytes, DecodeErrorKind> {
        self.slice(field).map(Bytes::copy_from_slice)
    }

    fn string(&mut self, field: &'static str) -> Result<String, DecodeErrorKind> {
        let bytes = self.slice(field)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeErrorKind::InvalidUtf8 { field })
    }

    fn opt_string(&mut self, field: &'static str) -> Result<Option<String>, DecodeErrorKind> {
        if self.flag(field)? {
            self.string(field).map(Some)
        } else {
            Ok(None)
        }
    }
}

fn content_kind_code(kind: ContentKind) -> u8 {
    match kind {
        ContentKind::Image => 0,
        ContentKind::Video => 1,
        ContentKind::Text => 2,
        ContentKind::Webpage => 3,
    }
}

fn content_kind_from(value: u8) -> Result<ContentKind, DecodeErrorKind> {
    match value {
        0 => Ok(ContentKind::Image),
        1 => Ok(ContentKind::Video),
        2 => Ok(ContentKind::Text),
        3 => Ok(ContentKind::Webpage),
        value => Err(DecodeErrorKind::InvalidEnum {
            field: "kind",
            value,
        }),
    }
}

fn outcome_code(outcome: AckOutcome) -> u8 {
    match outcome {
        AckOutcome::Success => 0,
        AckOutcome::Failed => 1,
        AckOutcome::Rejected => 2,
    }
}

fn outcome_from(value: u8) -> Result<AckOutcome, DecodeErrorKind> {
    match value {
        0 => Ok(AckOutcome::Success),
        1 => Ok(AckOutcome::Failed),
        2 => Ok(AckOutcome::Rejected),
        value => Err(DecodeErrorKind::InvalidEnum {
            field: "outcome",
            value,
        }),
    }
}

fn broadcast_level_code(level: BroadcastLevel) -> u8 {
    match level {
        BroadcastLevel::Info => 0,
        BroadcastLevel::Warning => 1,
        BroadcastLevel::Critical => 2,
    }
}

fn broadcast_level_from(value: u8) -> Result<BroadcastLevel, DecodeErrorKind> {
    match value {
        0 => Ok(BroadcastLevel::Info),
        1 => Ok(BroadcastLevel::Warning),
        2 => Ok(BroadcastLevel::Critical),
        value => Err(DecodeErrorKind::InvalidEnum {
            field: "level",
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_payloads() -> Vec<DevicePayload> {
        vec![
            DevicePayload::invoke("screenshot", Bytes::from_static(b"{\"quality\":80}")),
            DevicePayload::content_push("c-42", ContentKind::Video, "https://cdn/x.mp4", 30),
            DevicePayload::Register {
                device_id: "frame-01".to_string(),
                name: "Lobby frame".to_string(),
                capabilities: vec!["display".to_string(), "audio".to_string()],
            },
            DevicePayload::Heartbeat {
                timestamp_ms: 1_700_000_000_000,
                uptime_secs: 3600,
            },
            DevicePayload::Status {
                online: false,
                detail: None,
            },
            DevicePayload::Telemetry {
                kind: "temperature".to_string(),
                value: -4,
            },
            DevicePayload::Ack {
                correlation_id: Uuid::new_v4(),
                outcome: AckOutcome::Rejected,
                detail: Some("busy".to_string()),
            },
            DevicePayload::ContentResponse {
                content_id: "c-42".to_string(),
                outcome: AckOutcome::Failed,
                error: Some("404".to_string()),
            },
            DevicePayload::Broadcast {
                level: BroadcastLevel::Critical,
                message: "maintenance at 02:00".to_string(),
            },
        ]
    }

    #[test]
    fn test_every_variant_round_trips() {
        for payload in sample_payloads() {
            let encoded = encode(&payload);
            assert_eq!(encoded[0], SCHEMA_VERSION);
            assert_eq!(encoded[1], type_id(&payload));
            assert_eq!(decode(&encoded), Ok(payload));
        }
    }

    #[test]
    fn test_telemetry_wire_layout() {
        let encoded = encode(&DevicePayload::Telemetry {
            kind: "t".to_string(),
            value: 21,
        });
        assert_eq!(
            encoded.as_ref(),
            &[0x01, 0x81, 0, 0, 0, 1, b't', 0, 0, 0, 0, 0, 0, 0, 21]
        );
    }

    #[test]
    fn test_empty_and_unknown_payloads() {
        assert_eq!(decode(&[]).unwrap_err().kind, DecodeErrorKind::Empty);
        assert_eq!(
            decode(&[0x02, 0x81]).unwrap_err().kind,
            DecodeErrorKind::UnsupportedVersion(2)
        );
        assert_eq!(
            decode(&[0x01, 0x7f]).unwrap_err().kind,
            DecodeErrorKind::UnknownType(0x7f)
        );
    }

    #[test]
    fn test_malformed_payload_keeps_raw_bytes() {
        let raw = b"{\"not\":\"binary\"}";
        let error = decode(raw).unwrap_err();
        assert_eq!(error.raw.as_ref(), raw);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut encoded = encode(&DevicePayload::Status {
            online: true,
            detail: None,
        })
        .to_vec();
        encoded.push(0);
        assert_eq!(
            decode(&encoded).unwrap_err().kind,
            DecodeErrorKind::TrailingBytes(1)
        );
    }

    #[test]
    fn test_invalid_enum_and_utf8() {
        assert_eq!(
            decode(&[0x01, TYPE_STATUS, 7, 0]).unwrap_err().kind,
            DecodeErrorKind::InvalidEnum {
                field: "online",
                value: 7
            }
        );
        assert_eq!(
            decode(&[0x01, TYPE_BROADCAST, 0, 0, 0, 0, 1, 0xff])
                .unwrap_err()
                .kind,
            DecodeErrorKind::InvalidUtf8 { field: "message" }
        );
    }

    #[test]
    fn test_huge_capability_count_is_truncation() {
        let mut raw = vec![0x01, TYPE_REGISTER];
        raw.extend_from_slice(&[0, 0, 0, 1, b'a', 0, 0, 0, 1, b'b']);
        raw.extend_from_slice(&u32::MAX.to_be_bytes());
        assert_eq!(
            decode(&raw).unwrap_err().kind,
            DecodeErrorKind::Truncated {
                field: "capabilities"
            }
        );
    }

    proptest! {
        #[test]
        fn decode_never_panics(raw in prop::collection::vec(any::<u8>(), 0..128)) {
            let _ = decode(&raw);
        }

        #[test]
        fn every_truncation_is_rejected(index in 0usize..9, cut in 1usize..16) {
            let encoded = encode(&sample_payloads()[index]);
            let keep = encoded.len().saturating_sub(cut);
            prop_assert!(decode(&encoded[..keep]).is_err());
        }

        #[test]
        fn telemetry_round_trips(kind in ".{0,32}", value in any::<i64>()) {
            let payload = DevicePayload::Telemetry { kind, value };
            prop_assert_eq!(decode(&encode(&payload)), Ok(payload));
        }

        #[test]
        fn register_round_trips(
            device_id in "[a-z0-9-]{1,16}",
            name in ".{0,24}",
            capabilities in prop::collection::vec("[a-z]{1,8}", 0..6),
        ) {
            let payload = DevicePayload::Register { device_id, name, capabilities };
            prop_assert_eq!(decode(&encode(&payload)), Ok(payload));
        }
    }
}
