//! Frame codec (C1): turns raw WebSocket text into an [`Envelope`] and
//! back, enforcing the size cap before serde ever sees the bytes. Pure
//! and synchronous — no hub state, no I/O.

use hub_protocol::{Envelope, MAX_FRAME_BYTES};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    TooLarge { len: usize },
    Malformed(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::TooLarge { len } => write!(f, "frame of {len} bytes exceeds {MAX_FRAME_BYTES}"),
            DecodeError::Malformed(msg) => write!(f, "malformed frame: {msg}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Rejects oversize frames before attempting to parse them, then decodes
/// the JSON envelope. The declared `size` field inside the envelope is
/// never trusted in place of the actual byte length.
pub fn decode_frame(raw: &str) -> Result<Envelope, DecodeError> {
    let len = raw.len();
    if len > MAX_FRAME_BYTES {
        return Err(DecodeError::TooLarge { len });
    }
    serde_json::from_str(raw).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// Serializes any outbound frame shape to the JSON text sent over the wire.
pub fn encode_frame<T: serde::Serialize>(frame: &T) -> String {
    serde_json::to_string(frame).expect("outbound frame types are always serializable")
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_protocol::{Ack, MsgPayload};
    use uuid::Uuid;

    #[test]
    fn decode_rejects_frames_over_the_size_cap() {
        let raw = "x".repeat(MAX_FRAME_BYTES + 1);
        assert_eq!(decode_frame(&raw), Err(DecodeError::TooLarge { len: raw.len() }));
    }

    #[test]
    fn decode_rejects_unknown_type_tags() {
        let raw = r#"{"type":"bogus","id":"00000000-0000-0000-0000-000000000000","size":1,"payload":{}}"#;
        assert!(matches!(decode_frame(raw), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn decode_accepts_a_valid_msg_envelope() {
        let raw = serde_json::json!({
            "type": "msg",
            "id": Uuid::nil(),
            "size": 5,
            "payload": {"seq": 1, "data": null}
        })
        .to_string();
        let env = decode_frame(&raw).expect("valid frame decodes");
        assert_eq!(env.kind(), "msg");
    }

    #[test]
    fn encode_round_trips_an_ack() {
        let ack = Ack::accepted(Uuid::nil(), 7);
        let raw = encode_frame(&ack);
        let back: Ack = serde_json::from_str(&raw).unwrap();
        assert_eq!(ack, back);
    }

    #[test]
    fn encode_omits_size_validation_its_the_callers_declared_value() {
        let env = Envelope::Msg { id: Uuid::nil(), size: 999, payload: MsgPayload { seq: 1, data: None } };
        let raw = encode_frame(&env);
        assert!(raw.contains("\"size\":999"));
    }
}
