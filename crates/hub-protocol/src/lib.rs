// hub-protocol: wire types for the realtime message-delivery hub.
//
// Every frame crossing the socket is a discriminated union tagged on
// `type`, mirroring the envelope schema the hub and its clients agree on.
// This crate is pure data + (de)serialization: no I/O, no hub logic.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hard cap on a single frame's raw byte length, enforced by the codec
/// before this crate's deserialization ever runs.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Max `read.messageIds` entries per frame.
pub const MAX_READ_MESSAGE_IDS: usize = 100;

// ---------------------------------------------------------------------------
// Inbound payloads
// ---------------------------------------------------------------------------

/// An application message the client wants relayed/acked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgPayload {
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Ephemeral typing-indicator payload. Never acked, never replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub conversation_id: Uuid,
    pub state: TypingState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypingState {
    Start,
    Stop,
}

/// Read-receipt payload; `message_ids` is capped at [`MAX_READ_MESSAGE_IDS`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPayload {
    pub conversation_id: Uuid,
    pub message_ids: Vec<Uuid>,
}

/// Resume request: presents a previously issued token and the last
/// client-originated sequence number the client has seen acked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePayload {
    pub resume_token: Uuid,
    pub last_client_seq: u64,
}

// ---------------------------------------------------------------------------
// Envelope (the only frame shape clients send)
// ---------------------------------------------------------------------------

/// Discriminated union over every inbound frame type.
///
/// `id` and `size` are carried for every variant even though only `msg`
/// needs `id` for dedup and acking; `size` is a declared hint the codec
/// cross-checks against the actual frame length, never trusted alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Msg {
        id: Uuid,
        size: u32,
        payload: MsgPayload,
    },
    Typing {
        id: Uuid,
        size: u32,
        payload: TypingPayload,
    },
    Read {
        id: Uuid,
        size: u32,
        payload: ReadPayload,
    },
    Resume {
        id: Uuid,
        size: u32,
        payload: ResumePayload,
    },
}

impl Envelope {
    pub fn id(&self) -> Uuid {
        match self {
            Envelope::Msg { id, .. }
            | Envelope::Typing { id, .. }
            | Envelope::Read { id, .. }
            | Envelope::Resume { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Msg { .. } => "msg",
            Envelope::Typing { .. } => "typing",
            Envelope::Read { .. } => "read",
            Envelope::Resume { .. } => "resume",
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound frames (hub -> client)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Accepted,
    Rejected,
}

/// Acknowledgement of an inbound `msg`/`typing`/`read` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "ack")]
pub struct Ack {
    pub id: Uuid,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Ack {
    pub fn accepted(id: Uuid, seq: u64) -> Self {
        Self { id, status: AckStatus::Accepted, seq: Some(seq), reason: None }
    }

    pub fn rejected(id: Uuid, reason: impl Into<String>) -> Self {
        Self { id, status: AckStatus::Rejected, seq: None, reason: Some(reason.into()) }
    }
}

/// Response to a successful `resume` handshake, always the first frame
/// sent once a resume request is accepted (before any replayed frames).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "resume_ack")]
pub struct ResumeAck {
    pub from_seq: u64,
    pub expires_in_ms: i64,
    pub resume_token: Uuid,
}

/// Close-code reasons, frozen so client and hub agree on string spelling.
pub mod close_reason {
    pub const PROTOCOL_ERROR: &str = "protocol_error";
    pub const INVALID_RESUME: &str = "invalid_resume";
    pub const HEARTBEAT_TERMINATE: &str = "heartbeat_terminate";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const MESSAGE_RATE_LIMITED: &str = "message_rate_limited";
    pub const INVALID_TOKEN: &str = "invalid_token";
    pub const EXPIRED_TOKEN: &str = "expired_token";
    pub const TOKEN_CONFLICT: &str = "token_conflict";
    pub const MESSAGE_TOO_LARGE: &str = "message_too_large";
    pub const SEND_FAILURE: &str = "send_failure";
    pub const OVERLOADED: &str = "overloaded";
    pub const CONNECTION_RATE_LIMITED: &str = "connection_rate_limited";
}

/// Close codes used alongside [`close_reason`] strings.
pub mod close_code {
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const HEARTBEAT_TERMINATE: u16 = 1006;
    pub const POLICY: u16 = 1008;
    pub const MESSAGE_TOO_LARGE: u16 = 1009;
    pub const SEND_FAILURE: u16 = 1011;
    pub const OVERLOADED: u16 = 1013;
}

/// A frame that has already been assigned a server sequence number and
/// appended to a connection's outbound log; what gets replayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub seq: u64,
    /// Pre-serialized JSON text, stored once at broadcast time so replay
    /// never re-serializes (and so replayed bytes are byte-identical).
    pub payload: String,
}

// ---------------------------------------------------------------------------
// Persisted resume state
// ---------------------------------------------------------------------------

/// The durable snapshot a resume store holds under a resume token.
///
/// `outbound_frames` is always a suffix of the owning connection's outbound
/// log at the moment it was snapshotted, ordered strictly increasing by
/// `seq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub resume_token: Uuid,
    pub account_id: String,
    pub device_id: String,
    pub last_server_seq: u64,
    /// Epoch milliseconds.
    pub expires_at: i64,
    pub outbound_frames: Vec<OutboundFrame>,
}

// ---------------------------------------------------------------------------
// Queue message envelope
// ---------------------------------------------------------------------------

/// A message handed to the hub by the external work queue. `id` is the
/// queue's own delivery identifier, used only for ack/reject — the hub
/// never interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub payload: Envelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

// ---------------------------------------------------------------------------
// Server -> client wire union (test/client-side convenience)
// ---------------------------------------------------------------------------

/// Every shape a client may read off the socket. `Envelope` covers the
/// frames the hub echoes back via broadcast (`msg`/`typing`/`read`); `Ack`
/// and `ResumeAck` are hub-originated. Tried in this order since each
/// variant's own `type` tag rejects the others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Ack(Ack),
    ResumeAck(ResumeAck),
    Envelope(Envelope),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_envelope_round_trips() {
        let env = Envelope::Msg {
            id: Uuid::nil(),
            size: 12,
            payload: MsgPayload { seq: 1, data: None },
        };
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
        assert_eq!(env.kind(), "msg");
    }

    #[test]
    fn resume_envelope_tag_is_snake_case() {
        let json = serde_json::json!({
            "type": "resume",
            "id": Uuid::nil(),
            "size": 40,
            "payload": {"resume_token": Uuid::nil(), "last_client_seq": 0}
        });
        let env: Envelope = serde_json::from_value(json).unwrap();
        assert!(matches!(env, Envelope::Resume { .. }));
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let json = serde_json::json!({"type": "bogus", "id": Uuid::nil(), "size": 1, "payload": {}});
        assert!(serde_json::from_value::<Envelope>(json).is_err());
    }

    #[test]
    fn resume_state_round_trips_through_json() {
        let state = ResumeState {
            resume_token: Uuid::new_v4(),
            account_id: "acct-1".to_owned(),
            device_id: "device-1".to_owned(),
            last_server_seq: 42,
            expires_at: 1_700_000_000_000,
            outbound_frames: vec![OutboundFrame { seq: 41, payload: "{}".to_owned() }],
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: ResumeState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn server_frame_distinguishes_ack_resume_ack_and_envelope() {
        let ack_json = serde_json::to_string(&Ack::accepted(Uuid::nil(), 3)).unwrap();
        assert!(matches!(
            serde_json::from_str::<ServerFrame>(&ack_json).unwrap(),
            ServerFrame::Ack(_)
        ));

        let resume_ack_json = serde_json::to_string(&ResumeAck {
            from_seq: 1,
            expires_in_ms: 1000,
            resume_token: Uuid::nil(),
        })
        .unwrap();
        assert!(matches!(
            serde_json::from_str::<ServerFrame>(&resume_ack_json).unwrap(),
            ServerFrame::ResumeAck(_)
        ));

        let env_json = serde_json::to_string(&Envelope::Msg {
            id: Uuid::nil(),
            size: 1,
            payload: MsgPayload { seq: 0, data: None },
        })
        .unwrap();
        assert!(matches!(
            serde_json::from_str::<ServerFrame>(&env_json).unwrap(),
            ServerFrame::Envelope(Envelope::Msg { .. })
        ));
    }

    #[test]
    fn ack_serializes_without_null_fields() {
        let ack = Ack::accepted(Uuid::nil(), 5);
        let json = serde_json::to_value(&ack).unwrap();
        assert!(json.get("reason").is_none());
    }
}
