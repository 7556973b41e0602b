//! Frame handler (C7): dispatch for a raw inbound frame on a known
//! `client_id`. `msg`/`typing`/`read` are acked here; `resume` is handed off
//! to the replay engine in `resume.rs`.

use std::sync::Arc;

use hub_protocol::{close_code, close_reason, Ack, Envelope, MAX_FRAME_BYTES};

use crate::codec;
use crate::connection::now_ms;
use crate::hub::Hub;
use crate::metrics::{self, MetricEvent};

/// Steps 1-8 of the frame handler. Silently discards the frame if
/// `client_id` has no live connection (it may have just closed).
pub async fn handle_frame(hub: &Arc<Hub>, client_id: &str, raw: &str) {
    let received_at = now_ms();
    let Some(conn) = hub.get_connection(client_id).await else {
        return;
    };

    if let Some(limiter) = hub.message_rate_limiter() {
        if !limiter.consume(&conn.account_id).await {
            conn.close(close_code::POLICY, close_reason::MESSAGE_RATE_LIMITED).await;
            return;
        }
    }

    if raw.len() > MAX_FRAME_BYTES {
        metrics::record(&MetricEvent::InvalidSize { len: raw.len() });
        conn.close(close_code::MESSAGE_TOO_LARGE, close_reason::MESSAGE_TOO_LARGE).await;
        return;
    }

    let envelope = match codec::decode_frame(raw) {
        Ok(envelope) => envelope,
        Err(err) => {
            let reason = err.to_string();
            metrics::record(&MetricEvent::InvalidFrame { reason: &reason });
            conn.close(close_code::PROTOCOL_ERROR, close_reason::PROTOCOL_ERROR).await;
            return;
        }
    };

    conn.touch_last_seen().await;
    hub.schedule_heartbeat(Arc::clone(&conn)).await;

    if matches!(envelope, Envelope::Resume { .. }) {
        crate::resume::handle_resume(hub, &conn, envelope).await;
        return;
    }

    let envelope_id = envelope.id();
    match conn.mark_in_flight_and_bump_sequence(envelope_id).await {
        None => {
            metrics::record(&MetricEvent::AckRejected { account_id: &conn.account_id, reason: "duplicate" });
            let ack = Ack::rejected(envelope_id, "duplicate");
            hub.safe_send(&conn, codec::encode_frame(&ack)).await;
        }
        Some(client_sequence) => {
            metrics::record(&MetricEvent::AckSent { account_id: &conn.account_id });
            metrics::record(&MetricEvent::AckLatency {
                account_id: &conn.account_id,
                millis: (now_ms() - received_at) as f64,
            });
            let ack = Ack::accepted(envelope_id, client_sequence);
            hub.safe_send(&conn, codec::encode_frame(&ack)).await;
            conn.clear_in_flight(envelope_id).await;
        }
    }
}
