//! Client lifecycle (C6): authenticate, rate-limit, register, and the two
//! socket-driven callbacks (`close`, `pong`) a connection reacts to for the
//! rest of its life. The `ws` module's read loop calls into this module
//! directly — axum's `WebSocket` has no event-callback API of its own, so
//! "bind socket event callbacks" (§4.6 step 4) becomes "call these functions
//! from the right place in the read loop" instead.

use std::sync::Arc;

use axum::http::HeaderMap;
use hub_protocol::{close_code, close_reason};

use crate::connection::Connection;
use crate::hub::Hub;
use crate::metrics::{self, MetricEvent};
use crate::socket::Socket;

const CODE_NORMAL_CLOSURE: u16 = 1000;
const REASON_CLIENT_CLOSED: &str = "client_closed";

/// `register(socket, clientId, headers)`: authenticates, applies the
/// connection-rate limiter if configured, constructs and registers the
/// `Connection`, persists an initial snapshot, and schedules its heartbeat.
/// Returns the resume token the caller hands back to the client on success.
pub async fn register(
    hub: &Arc<Hub>,
    socket: Arc<dyn Socket>,
    client_id: String,
    headers: &HeaderMap,
) -> Option<Arc<Connection>> {
    let Some(claims) = hub.authenticator().authenticate(headers, &client_id).await else {
        let _ = socket.close(close_code::POLICY, close_reason::UNAUTHORIZED.to_owned()).await;
        metrics::record(&MetricEvent::Closed {
            account_id: "",
            device_id: "",
            code: close_code::POLICY,
            reason: close_reason::UNAUTHORIZED,
        });
        return None;
    };

    if let Some(limiter) = hub.connection_rate_limiter() {
        if !limiter.consume(&claims.account_id).await {
            let _ = socket.close(close_code::OVERLOADED, close_reason::CONNECTION_RATE_LIMITED.to_owned()).await;
            metrics::record(&MetricEvent::Closed {
                account_id: &claims.account_id,
                device_id: &claims.device_id,
                code: close_code::OVERLOADED,
                reason: close_reason::CONNECTION_RATE_LIMITED,
            });
            return None;
        }
    }

    let (resume_token, resume_token_expires_at) = hub.next_resume_token();
    let conn = Connection::new(
        client_id,
        claims.account_id,
        claims.device_id,
        socket,
        resume_token,
        resume_token_expires_at,
        hub.config.max_queue_length,
        hub.config.outbound_log_limit,
    );
    hub.insert_connection(Arc::clone(&conn)).await;

    if let Err(err) = hub.persist_snapshot(&conn).await {
        tracing::warn!(error = %err, client_id = %conn.client_id, "failed to persist initial resume snapshot");
    }
    metrics::record(&MetricEvent::Connected { account_id: &conn.account_id, device_id: &conn.device_id });
    hub.schedule_heartbeat(Arc::clone(&conn)).await;

    Some(conn)
}

/// Socket `close` callback: removes the connection from the registry,
/// cancels its heartbeat timers, persists a final snapshot, and emits
/// `ws_closed`.
pub async fn handle_close(hub: &Arc<Hub>, conn: &Arc<Connection>) {
    conn.cancel_timers().await;
    hub.remove_connection(&conn.client_id).await;
    if let Err(err) = hub.persist_snapshot(conn).await {
        tracing::warn!(error = %err, client_id = %conn.client_id, "failed to persist final resume snapshot");
    }
    metrics::record(&MetricEvent::Closed {
        account_id: &conn.account_id,
        device_id: &conn.device_id,
        code: CODE_NORMAL_CLOSURE,
        reason: REASON_CLIENT_CLOSED,
    });
}

/// Socket `pong` callback: updates `lastSeenAt`, observes ping latency if a
/// ping was outstanding, cancels the now-moot termination timer, and
/// re-arms the primary heartbeat timer.
pub async fn handle_pong(hub: &Arc<Hub>, conn: &Arc<Connection>) {
    if let Some(latency_ms) = conn.record_pong().await {
        metrics::record(&MetricEvent::PingLatency { account_id: &conn.account_id, millis: latency_ms });
    }
    conn.cancel_timers().await;
    hub.schedule_heartbeat(Arc::clone(conn)).await;
}
