//! Typed metric-event taxonomy (C9), realized with the `metrics` facade
//! crate the way the pack's OPRF service declares its metrics: a set of
//! name constants, a `describe_metrics` call-once-at-startup function, and
//! a single `record` entry point that turns a `MetricEvent` into the
//! right `counter!`/`histogram!` call. The hub never exposes a scrape
//! endpoint itself — it only records into whatever global recorder the
//! embedding application installs.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};

pub const WS_CONNECTED: &str = "ws_connected";
pub const WS_CLOSED: &str = "ws_closed";
pub const WS_INVALID_FRAME: &str = "ws_invalid_frame";
pub const WS_INVALID_SIZE: &str = "ws_invalid_size";
pub const WS_ACK_SENT: &str = "ws_ack_sent";
pub const WS_ACK_REJECTED: &str = "ws_ack_rejected";
pub const WS_HEARTBEAT_TERMINATE: &str = "ws_heartbeat_terminate";
pub const WS_OVERLOADED: &str = "ws_overloaded";
pub const WS_FRAME_SENT: &str = "ws_frame_sent";
pub const WS_SEND_ERROR: &str = "ws_send_error";
pub const WS_REPLAY_START: &str = "ws_replay_start";
pub const WS_REPLAY_BATCH_SENT: &str = "ws_replay_batch_sent";
pub const WS_REPLAY_BACKPRESSURE_HITS: &str = "ws_replay_backpressure_hits";
pub const WS_REPLAY_COMPLETE: &str = "ws_replay_complete";
pub const WS_RESUME_TOKEN_ROTATED: &str = "ws_resume_token_rotated";
pub const WS_PING_LATENCY: &str = "ws_ping_latency";
pub const WS_ACK_LATENCY: &str = "ws_ack_latency";

pub fn describe_metrics() {
    describe_counter!(WS_CONNECTED, Unit::Count, "connections successfully registered");
    describe_counter!(WS_CLOSED, Unit::Count, "connections torn down, labeled by code+reason");
    describe_counter!(WS_INVALID_FRAME, Unit::Count, "inbound frames rejected by the codec");
    describe_counter!(WS_INVALID_SIZE, Unit::Count, "inbound frames rejected for exceeding the size cap");
    describe_counter!(WS_ACK_SENT, Unit::Count, "accepted acks emitted");
    describe_counter!(WS_ACK_REJECTED, Unit::Count, "rejected acks emitted, labeled by reason");
    describe_counter!(WS_HEARTBEAT_TERMINATE, Unit::Count, "connections terminated for a missed pong");
    describe_counter!(WS_OVERLOADED, Unit::Count, "connections closed for backpressure/queue overload");
    describe_counter!(WS_FRAME_SENT, Unit::Count, "outbound frames successfully handed to the socket");
    describe_counter!(WS_SEND_ERROR, Unit::Count, "fatal send-primitive failures");
    describe_counter!(WS_REPLAY_START, Unit::Count, "resume replays started");
    describe_counter!(WS_REPLAY_BATCH_SENT, Unit::Count, "replay batches attempted");
    describe_counter!(WS_REPLAY_BACKPRESSURE_HITS, Unit::Count, "replay batches halted by backpressure");
    describe_counter!(WS_REPLAY_COMPLETE, Unit::Count, "resume replays completed");
    describe_counter!(WS_RESUME_TOKEN_ROTATED, Unit::Count, "resume tokens rotated");
    describe_histogram!(WS_PING_LATENCY, Unit::Milliseconds, "heartbeat ping-to-pong latency");
    describe_histogram!(WS_ACK_LATENCY, Unit::Milliseconds, "inbound-frame-to-ack latency");
}

/// Collapses an empty/unknown identifier to a fixed placeholder so a
/// misbehaving client can't blow up label cardinality.
pub fn account_label(account_id: &str) -> &str {
    if account_id.is_empty() { "acct" } else { account_id }
}

pub fn device_label(device_id: &str) -> &str {
    if device_id.is_empty() { "device" } else { device_id }
}

#[derive(Debug, Clone)]
pub enum MetricEvent<'a> {
    Connected { account_id: &'a str, device_id: &'a str },
    Closed { account_id: &'a str, device_id: &'a str, code: u16, reason: &'a str },
    InvalidFrame { reason: &'a str },
    InvalidSize { len: usize },
    AckSent { account_id: &'a str },
    AckRejected { account_id: &'a str, reason: &'a str },
    HeartbeatTerminate { account_id: &'a str, device_id: &'a str },
    Overloaded { account_id: &'a str, device_id: &'a str },
    FrameSent { account_id: &'a str },
    SendError { account_id: &'a str, device_id: &'a str, name: &'a str },
    ReplayStart { account_id: &'a str },
    ReplayBatchSent { account_id: &'a str, batch_len: usize },
    ReplayBackpressureHits { account_id: &'a str },
    ReplayComplete { account_id: &'a str, replay_count: u64, batches: u64 },
    ResumeTokenRotated { account_id: &'a str, redacted_token: &'a str },
    PingLatency { account_id: &'a str, millis: f64 },
    AckLatency { account_id: &'a str, millis: f64 },
}

/// The single place a `MetricEvent` turns into `counter!`/`histogram!`
/// calls. Kept separate from the emitting call sites so every event's
/// label set is defined exactly once.
pub fn record(event: &MetricEvent<'_>) {
    match event {
        MetricEvent::Connected { account_id, device_id } => {
            counter!(WS_CONNECTED, "account" => account_label(account_id).to_owned(), "device" => device_label(device_id).to_owned()).increment(1);
        }
        MetricEvent::Closed { account_id, device_id, code, reason } => {
            counter!(
                WS_CLOSED,
                "account" => account_label(account_id).to_owned(),
                "device" => device_label(device_id).to_owned(),
                "code" => code.to_string(),
                "reason" => (*reason).to_owned(),
            )
            .increment(1);
        }
        MetricEvent::InvalidFrame { reason } => {
            counter!(WS_INVALID_FRAME, "reason" => (*reason).to_owned()).increment(1);
        }
        MetricEvent::InvalidSize { len } => {
            counter!(WS_INVALID_SIZE, "bytes" => len.to_string()).increment(1);
        }
        MetricEvent::AckSent { account_id } => {
            counter!(WS_ACK_SENT, "account" => account_label(account_id).to_owned()).increment(1);
        }
        MetricEvent::AckRejected { account_id, reason } => {
            counter!(WS_ACK_REJECTED, "account" => account_label(account_id).to_owned(), "reason" => (*reason).to_owned()).increment(1);
        }
        MetricEvent::HeartbeatTerminate { account_id, device_id } => {
            counter!(WS_HEARTBEAT_TERMINATE, "account" => account_label(account_id).to_owned(), "device" => device_label(device_id).to_owned()).increment(1);
        }
        MetricEvent::Overloaded { account_id, device_id } => {
            counter!(WS_OVERLOADED, "account" => account_label(account_id).to_owned(), "device" => device_label(device_id).to_owned()).increment(1);
        }
        MetricEvent::FrameSent { account_id } => {
            counter!(WS_FRAME_SENT, "account" => account_label(account_id).to_owned()).increment(1);
        }
        MetricEvent::SendError { account_id, device_id, name } => {
            counter!(WS_SEND_ERROR, "account" => account_label(account_id).to_owned(), "device" => device_label(device_id).to_owned(), "name" => (*name).to_owned()).increment(1);
        }
        MetricEvent::ReplayStart { account_id } => {
            counter!(WS_REPLAY_START, "account" => account_label(account_id).to_owned()).increment(1);
        }
        MetricEvent::ReplayBatchSent { account_id, batch_len } => {
            counter!(WS_REPLAY_BATCH_SENT, "account" => account_label(account_id).to_owned(), "batch_len" => batch_len.to_string()).increment(1);
        }
        MetricEvent::ReplayBackpressureHits { account_id } => {
            counter!(WS_REPLAY_BACKPRESSURE_HITS, "account" => account_label(account_id).to_owned()).increment(1);
        }
        MetricEvent::ReplayComplete { account_id, replay_count, batches } => {
            counter!(
                WS_REPLAY_COMPLETE,
                "account" => account_label(account_id).to_owned(),
                "replay_count" => replay_count.to_string(),
                "batches" => batches.to_string(),
            )
            .increment(1);
        }
        MetricEvent::ResumeTokenRotated { account_id, redacted_token } => {
            counter!(WS_RESUME_TOKEN_ROTATED, "account" => account_label(account_id).to_owned(), "token" => (*redacted_token).to_owned()).increment(1);
        }
        MetricEvent::PingLatency { account_id, millis } => {
            histogram!(WS_PING_LATENCY, "account" => account_label(account_id).to_owned()).record(*millis);
        }
        MetricEvent::AckLatency { account_id, millis } => {
            histogram!(WS_ACK_LATENCY, "account" => account_label(account_id).to_owned()).record(*millis);
        }
    }
}

/// Redacts a resume token for logs/metrics: first 4 / last 4 hex chars,
/// `***redacted***` for anything shorter.
pub fn redact_token(token: &uuid::Uuid) -> String {
    let s = token.simple().to_string();
    if s.len() >= 8 {
        format!("{}...{}", &s[..4], &s[s.len() - 4..])
    } else {
        "***redacted***".to_owned()
    }
}
