//! Wire codec: payload text encoding and protocol event decoding.
//!
//! ## Event format
//!
//! A client frame is a UTF-8 JSON object whose `msg_type` field selects the
//! event:
//!
//! ```text
//! {"msg_type": 1, "heartbeat_interval": 5}   connect (interval in seconds)
//! {"msg_type": 2}                             disconnect
//! {"msg_type": 3}                             heartbeat
//! {"msg_type": 4, "payload": "hello"}         message
//! ```
//!
//! Server frames carry the response text itself (UTF-8, no envelope), e.g.
//! `is_connected: True` after a successful connect.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Acknowledgement sent once a client's connect frame is accepted.
pub const CONNECTED_RESPONSE: &str = "is_connected: True";

/// Discriminant of a client frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Connect = 1,
    Disconnect = 2,
    Heartbeat = 3,
    Message = 4,
}

impl TryFrom<u64> for MessageType {
    type Error = DecodeError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Connect),
            2 => Ok(MessageType::Disconnect),
            3 => Ok(MessageType::Heartbeat),
            4 => Ok(MessageType::Message),
            other => Err(DecodeError::UnknownType(other)),
        }
    }
}

/// One decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// Opens the session and declares how often the client will heartbeat.
    Connect { heartbeat_interval: Duration },
    /// Orderly goodbye; the server sends nothing back.
    Disconnect,
    /// Liveness signal with no content.
    Heartbeat,
    /// Application message handed to the pipeline.
    Message { payload: String },
}

impl ProtocolEvent {
    pub fn message_type(&self) -> MessageType {
        match self {
            ProtocolEvent::Connect { .. } => MessageType::Connect,
            ProtocolEvent::Disconnect => MessageType::Disconnect,
            ProtocolEvent::Heartbeat => MessageType::Heartbeat,
            ProtocolEvent::Message { .. } => MessageType::Message,
        }
    }
}

/// Reasons a frame could not be decoded. Fatal to the frame only.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown message type {0}")]
    UnknownType(u64),

    #[error("connect frame without heartbeat_interval")]
    MissingInterval,

    #[error("invalid heartbeat interval {0}")]
    InvalidInterval(f64),

    #[error("message frame without payload")]
    MissingPayload,
}

/// Frame layout as it appears on the wire.
#[derive(Debug, Serialize, Deserialize)]
struct RawFrame {
    msg_type: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    heartbeat_interval: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
}

impl TryFrom<RawFrame> for ProtocolEvent {
    type Error = DecodeError;

    fn try_from(raw: RawFrame) -> Result<Self, Self::Error> {
        match MessageType::try_from(raw.msg_type)? {
            MessageType::Connect => {
                let secs = raw.heartbeat_interval.ok_or(DecodeError::MissingInterval)?;
                if !(secs.is_finite() && secs > 0.0) {
                    return Err(DecodeError::InvalidInterval(secs));
                }
                let heartbeat_interval = Duration::try_from_secs_f64(secs)
                    .map_err(|_| DecodeError::InvalidInterval(secs))?;
                Ok(ProtocolEvent::Connect { heartbeat_interval })
            }
            MessageType::Disconnect => Ok(ProtocolEvent::Disconnect),
            MessageType::Heartbeat => Ok(ProtocolEvent::Heartbeat),
            MessageType::Message => {
                let payload = raw.payload.ok_or(DecodeError::MissingPayload)?;
                Ok(ProtocolEvent::Message { payload })
            }
        }
    }
}

impl From<&ProtocolEvent> for RawFrame {
    fn from(event: &ProtocolEvent) -> Self {
        let mut raw = RawFrame {
            msg_type: event.message_type() as u64,
            heartbeat_interval: None,
            payload: None,
        };
        match event {
            ProtocolEvent::Connect { heartbeat_interval } => {
                raw.heartbeat_interval = Some(heartbeat_interval.as_secs_f64());
            }
            ProtocolEvent::Message { payload } => raw.payload = Some(payload.clone()),
            ProtocolEvent::Disconnect | ProtocolEvent::Heartbeat => {}
        }
        raw
    }
}

/// Stateless UTF-8 codec shared by the server session and the client.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireCodec;

impl WireCodec {
    /// Encode a response payload.
    pub fn encode(&self, payload: &str) -> Bytes {
        Bytes::copy_from_slice(payload.as_bytes())
    }

    /// Decode a response payload.
    pub fn decode(&self, bytes: &[u8]) -> Result<String, DecodeError> {
        Ok(std::str::from_utf8(bytes)?.to_owned())
    }

    /// Decode one client frame into a protocol event.
    pub fn decode_event(&self, bytes: &[u8]) -> Result<ProtocolEvent, DecodeError> {
        let text = std::str::from_utf8(bytes)?;
        let raw: RawFrame = serde_json::from_str(text)?;
        ProtocolEvent::try_from(raw)
    }

    /// Encode one client frame.
    pub fn encode_event(&self, event: &ProtocolEvent) -> Result<Bytes, DecodeError> {
        Ok(Bytes::from(serde_json::to_vec(&RawFrame::from(event))?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_each_message_type() {
        let codec = WireCodec;

        assert_eq!(
            codec
                .decode_event(br#"{"msg_type": 1, "heartbeat_interval": 5}"#)
                .unwrap(),
            ProtocolEvent::Connect {
                heartbeat_interval: Duration::from_secs(5)
            }
        );
        assert_eq!(
            codec.decode_event(br#"{"msg_type": 2}"#).unwrap(),
            ProtocolEvent::Disconnect
        );
        assert_eq!(
            codec.decode_event(br#"{"msg_type": 3}"#).unwrap(),
            ProtocolEvent::Heartbeat
        );
        assert_eq!(
            codec
                .decode_event(br#"{"msg_type": 4, "payload": "hello"}"#)
                .unwrap(),
            ProtocolEvent::Message {
                payload: "hello".into()
            }
        );
    }

    #[test]
    fn test_fractional_heartbeat_interval() {
        let event = WireCodec
            .decode_event(br#"{"msg_type": 1, "heartbeat_interval": 0.25}"#)
            .unwrap();
        assert_eq!(
            event,
            ProtocolEvent::Connect {
                heartbeat_interval: Duration::from_millis(250)
            }
        );
    }

    #[test]
    fn test_malformed_frames() {
        let codec = WireCodec;

        assert!(matches!(
            codec.decode_event(&[0xff, 0xfe]),
            Err(DecodeError::Utf8(_))
        ));
        assert!(matches!(
            codec.decode_event(b"hello"),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            codec.decode_event(br#"{"msg_type": 9}"#),
            Err(DecodeError::UnknownType(9))
        ));
        assert!(matches!(
            codec.decode_event(br#"{"msg_type": 1}"#),
            Err(DecodeError::MissingInterval)
        ));
        assert!(matches!(
            codec.decode_event(br#"{"msg_type": 1, "heartbeat_interval": -2}"#),
            Err(DecodeError::InvalidInterval(_))
        ));
        assert!(matches!(
            codec.decode_event(br#"{"msg_type": 4}"#),
            Err(DecodeError::MissingPayload)
        ));
    }

    #[test]
    fn test_encode_event_matches_wire_format() {
        let bytes = WireCodec
            .encode_event(&ProtocolEvent::Message {
                payload: "hi".into(),
            })
            .unwrap();
        assert_eq!(&bytes[..], br#"{"msg_type":4,"payload":"hi"}"#);

        let bytes = WireCodec.encode_event(&ProtocolEvent::Heartbeat).unwrap();
        assert_eq!(&bytes[..], br#"{"msg_type":3}"#);
    }

    #[test]
    fn test_payload_text() {
        let codec = WireCodec;
        assert_eq!(&codec.encode(CONNECTED_RESPONSE)[..], b"is_connected: True");
        assert_eq!(codec.decode("héllo".as_bytes()).unwrap(), "héllo");
        assert!(codec.decode(&[0xc3]).is_err());
    }
}
