//! Chat wire protocol definitions.
//!
//! All socket communication uses JSON text frames with a fixed envelope:
//! `{ id, type, data, timestamp?, user_id? }`. The `data` payload is
//! discriminated by `type`; see [`Payload`] for the enumerated schemas.
//!
//! Decoding is two-phase so malformed envelopes and unknown types stay
//! distinguishable: the raw envelope is parsed first, then `data` is parsed
//! against the schema selected by `type`.

pub mod keys;

use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

/// Upper bound on a single inbound frame. The historical 512-byte read limit
/// is too small for URLs and file names; the gateway treats this as a
/// tunable default.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4_096;
/// Capacity of a session's outbound queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;
/// How long a connection may stay silent before the read side gives up.
pub const PONG_WAIT_SECS: u64 = 60;
/// Deadline for one socket write.
pub const WRITE_WAIT_SECS: u64 = 10;
/// Bounded wait when handing an inbound frame to the hub.
pub const HUB_HANDOFF_WAIT_SECS: u64 = 5;
/// Grace period for session pumps to drain on shutdown.
pub const GRACEFUL_GRACE_SECS: u64 = 10;
/// Global shutdown deadline.
pub const SHUTDOWN_DEADLINE_SECS: u64 = 30;

/// Ping cadence derived from the pong wait (sent at 90% of the deadline).
#[must_use]
pub fn ping_period_secs(pong_wait_secs: u64) -> u64 {
    (pong_wait_secs * 9 / 10).max(1)
}

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
    pub const UNKNOWN_MESSAGE_TYPE: &str = "UNKNOWN_MESSAGE_TYPE";
    pub const INVALID_DATA: &str = "INVALID_DATA";
    pub const NOT_IN_CHANNEL: &str = "NOT_IN_CHANNEL";
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    pub const PERMISSION_ERROR: &str = "PERMISSION_ERROR";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const RATE_LIMIT_ERROR: &str = "RATE_LIMIT_ERROR";
    pub const PUBLISH_FAILED: &str = "PUBLISH_FAILED";
    pub const ERROR: &str = "ERROR";
}

// ── Codec errors ─────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Envelope is malformed: not JSON, missing/empty `id`, missing `type`.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Envelope is fine but `data` does not match the schema for `type`.
    #[error("invalid data for '{kind}': {reason}")]
    InvalidData { kind: String, reason: String },

    /// Well-formed envelope with a type outside the enumeration.
    #[error("unknown message type '{0}'")]
    UnknownType(String),
}

impl CodecError {
    /// The stable wire code reported back to the sender.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidFrame(_) => error_codes::INVALID_MESSAGE,
            Self::InvalidData { .. } => error_codes::INVALID_DATA,
            Self::UnknownType(_) => error_codes::UNKNOWN_MESSAGE_TYPE,
        }
    }
}

// ── Payload ──────────────────────────────────────────────────────────────────

/// The discriminated `data` payload, keyed by the envelope `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Payload {
    #[serde(rename = "channel.join")]
    ChannelJoin { channel_id: String },

    #[serde(rename = "channel.leave")]
    ChannelLeave { channel_id: String },

    #[serde(rename = "channel.message")]
    ChannelMessage {
        channel_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(
            default,
            rename = "fileName",
            skip_serializing_if = "Option::is_none"
        )]
        file_name: Option<String>,
        /// Persisted row id, present on server-published envelopes only.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_avatar: Option<String>,
    },

    #[serde(rename = "channel.typing")]
    ChannelTyping {
        channel_id: String,
        is_typing: bool,
    },

    #[serde(rename = "channel.stop_typing")]
    ChannelStopTyping { channel_id: String },

    #[serde(rename = "connection.ping")]
    ConnectionPing {},

    #[serde(rename = "connection.pong")]
    ConnectionPong { ping_id: String },

    /// Server-emitted registration ack.
    #[serde(rename = "connection.connect")]
    ConnectionConnect { client_id: String, status: String },

    #[serde(rename = "channel.member.join")]
    ChannelMemberJoin {
        channel_id: String,
        user_id: String,
    },

    #[serde(rename = "channel.member.leave")]
    ChannelMemberLeave {
        channel_id: String,
        user_id: String,
    },

    #[serde(rename = "user.status")]
    UserStatus { status: String, last_seen: u64 },

    /// Opaque server-to-user payload, forwarded as-is.
    #[serde(rename = "user.notification")]
    UserNotification(serde_json::Value),

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl Payload {
    /// The wire tag for this payload.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChannelJoin { .. } => "channel.join",
            Self::ChannelLeave { .. } => "channel.leave",
            Self::ChannelMessage { .. } => "channel.message",
            Self::ChannelTyping { .. } => "channel.typing",
            Self::ChannelStopTyping { .. } => "channel.stop_typing",
            Self::ConnectionPing {} => "connection.ping",
            Self::ConnectionPong { .. } => "connection.pong",
            Self::ConnectionConnect { .. } => "connection.connect",
            Self::ChannelMemberJoin { .. } => "channel.member.join",
            Self::ChannelMemberLeave { .. } => "channel.member.leave",
            Self::UserStatus { .. } => "user.status",
            Self::UserNotification(_) => "user.notification",
            Self::Error { .. } => "error",
        }
    }

    /// The channel this payload addresses, when it addresses one.
    #[must_use]
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            Self::ChannelJoin { channel_id }
            | Self::ChannelLeave { channel_id }
            | Self::ChannelMessage { channel_id, .. }
            | Self::ChannelTyping { channel_id, .. }
            | Self::ChannelStopTyping { channel_id }
            | Self::ChannelMemberJoin { channel_id, .. }
            | Self::ChannelMemberLeave { channel_id, .. } => Some(channel_id),
            _ => None,
        }
    }
}

const KNOWN_TYPES: &[&str] = &[
    "channel.join",
    "channel.leave",
    "channel.message",
    "channel.typing",
    "channel.stop_typing",
    "connection.ping",
    "connection.pong",
    "connection.connect",
    "channel.member.join",
    "channel.member.leave",
    "user.status",
    "user.notification",
    "error",
];

// ── Frame ────────────────────────────────────────────────────────────────────

/// The typed envelope exchanged on the socket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub id: String,
    #[serde(flatten)]
    pub payload: Payload,
    /// Seconds since epoch, producer-stamped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Server-filled on ingress from the authenticated session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Raw envelope used during decode so unknown types are distinguishable
/// from malformed frames.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    timestamp: Option<u64>,
    #[serde(default)]
    user_id: Option<String>,
}

impl Frame {
    /// Build a server-originated frame with a fresh id and timestamp.
    #[must_use]
    pub fn server(payload: Payload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            timestamp: Some(now_epoch_secs()),
            user_id: None,
        }
    }

    /// Build an `error` frame answering the given frame id.
    #[must_use]
    pub fn error(reply_to: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            id: reply_to.into(),
            payload: Payload::Error {
                code: code.to_string(),
                message: message.into(),
            },
            timestamp: Some(now_epoch_secs()),
            user_id: None,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|e| CodecError::InvalidFrame(e.to_string()))
    }

    /// Parse and validate a frame from raw bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let raw: RawFrame = serde_json::from_slice(bytes)
            .map_err(|e| CodecError::InvalidFrame(e.to_string()))?;

        let id = match raw.id {
            Some(id) if !id.is_empty() => id,
            Some(_) => return Err(CodecError::InvalidFrame("empty id".into())),
            None => return Err(CodecError::InvalidFrame("missing id".into())),
        };
        let kind = raw
            .kind
            .ok_or_else(|| CodecError::InvalidFrame("missing type".into()))?;
        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(CodecError::UnknownType(kind));
        }

        let data = raw.data.unwrap_or_else(|| serde_json::json!({}));
        let payload: Payload = serde_json::from_value(serde_json::json!({
            "type": kind,
            "data": data,
        }))
        .map_err(|e| CodecError::InvalidData {
            kind: kind.clone(),
            reason: e.to_string(),
        })?;
        validate_payload(&payload)?;

        Ok(Self {
            id,
            payload,
            timestamp: raw.timestamp,
            user_id: raw.user_id,
        })
    }
}

fn validate_payload(payload: &Payload) -> Result<(), CodecError> {
    match payload {
        Payload::ChannelMessage {
            channel_id,
            text,
            url,
            ..
        } => {
            if channel_id.is_empty() {
                return Err(CodecError::InvalidData {
                    kind: payload.kind().into(),
                    reason: "empty channel_id".into(),
                });
            }
            if text.as_deref().is_none_or(str::is_empty)
                && url.as_deref().is_none_or(str::is_empty)
            {
                return Err(CodecError::InvalidData {
                    kind: payload.kind().into(),
                    reason: "one of text or url is required".into(),
                });
            }
        },
        Payload::ChannelJoin { channel_id }
        | Payload::ChannelLeave { channel_id }
        | Payload::ChannelStopTyping { channel_id }
        | Payload::ChannelTyping { channel_id, .. } => {
            if channel_id.is_empty() {
                return Err(CodecError::InvalidData {
                    kind: payload.kind().into(),
                    reason: "empty channel_id".into(),
                });
            }
        },
        _ => {},
    }
    Ok(())
}

/// Seconds since the Unix epoch.
#[must_use]
pub fn now_epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_join_frame() {
        let frame =
            Frame::decode(br#"{"id":"m1","type":"channel.join","data":{"channel_id":"7"}}"#)
                .unwrap();
        assert_eq!(frame.id, "m1");
        assert_eq!(frame.payload, Payload::ChannelJoin {
            channel_id: "7".into()
        });
    }

    #[test]
    fn decode_rejects_missing_id() {
        let err = Frame::decode(br#"{"type":"channel.join","data":{"channel_id":"7"}}"#)
            .unwrap_err();
        assert!(matches!(err, CodecError::InvalidFrame(_)));
        assert_eq!(err.code(), error_codes::INVALID_MESSAGE);
    }

    #[test]
    fn decode_rejects_empty_id() {
        let err = Frame::decode(br#"{"id":"","type":"connection.ping","data":{}}"#).unwrap_err();
        assert!(matches!(err, CodecError::InvalidFrame(_)));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let err = Frame::decode(br#"{"id":"m1","type":"channel.archive","data":{}}"#).unwrap_err();
        match err {
            CodecError::UnknownType(kind) => assert_eq!(kind, "channel.archive"),
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_message_without_text_or_url() {
        let err =
            Frame::decode(br#"{"id":"m2","type":"channel.message","data":{"channel_id":"7"}}"#)
                .unwrap_err();
        assert_eq!(err.code(), error_codes::INVALID_DATA);
    }

    #[test]
    fn decode_accepts_message_with_url_only() {
        let frame = Frame::decode(
            br#"{"id":"m2","type":"channel.message","data":{"channel_id":"7","url":"https://x/y.png","fileName":"y.png"}}"#,
        )
        .unwrap();
        match frame.payload {
            Payload::ChannelMessage { url, file_name, .. } => {
                assert_eq!(url.as_deref(), Some("https://x/y.png"));
                assert_eq!(file_name.as_deref(), Some("y.png"));
            },
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn decode_ping_with_missing_data() {
        let frame = Frame::decode(br#"{"id":"p1","type":"connection.ping"}"#).unwrap();
        assert_eq!(frame.payload, Payload::ConnectionPing {});
    }

    #[test]
    fn round_trip_preserves_value() {
        let original = Frame {
            id: "m3".into(),
            payload: Payload::ChannelMessage {
                channel_id: "7".into(),
                text: Some("hi".into()),
                url: None,
                file_name: None,
                message_id: Some("101".into()),
                sender_name: Some("ada".into()),
                sender_avatar: None,
            },
            timestamp: Some(1_700_000_000),
            user_id: Some("42".into()),
        };
        let encoded = original.encode().unwrap();
        let decoded = Frame::decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded, original);
        // And the re-encoded JSON is value-identical.
        let reencoded = decoded.encode().unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&encoded).unwrap(),
            serde_json::from_str::<serde_json::Value>(&reencoded).unwrap()
        );
    }

    #[test]
    fn error_frame_echoes_request_id() {
        let frame = Frame::error("m9", error_codes::NOT_IN_CHANNEL, "join the channel first");
        assert_eq!(frame.id, "m9");
        match frame.payload {
            Payload::Error { code, .. } => assert_eq!(code, "NOT_IN_CHANNEL"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn user_notification_data_is_opaque() {
        let frame = Frame::decode(
            br#"{"id":"n1","type":"user.notification","data":{"anything":{"nested":true}}}"#,
        )
        .unwrap();
        match frame.payload {
            Payload::UserNotification(value) => {
                assert_eq!(value["anything"]["nested"], serde_json::json!(true));
            },
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn ping_period_is_ninety_percent() {
        assert_eq!(ping_period_secs(60), 54);
        assert_eq!(ping_period_secs(1), 1);
    }
}
