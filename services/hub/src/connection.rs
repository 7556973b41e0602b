//! Connection (data model + C2 SendGuard/queue): the state a single live
//! client holds — identity, resume bookkeeping, sequencing, dedup set,
//! outbound log, and the per-connection FIFO send queue with its fatal-error
//! latch. Everything here is mutated only under `inner`'s lock, the
//! per-connection serialization boundary the concurrency model calls for.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use hub_protocol::{close_code, close_reason, OutboundFrame};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::metrics::{self, MetricEvent};
use crate::socket::{Socket, SocketError, SocketState};

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

struct ConnectionInner {
    resume_token: Uuid,
    resume_token_expires_at: i64,
    server_sequence: u64,
    client_sequence: u64,
    in_flight: HashSet<Uuid>,
    outbound_log: VecDeque<OutboundFrame>,
    send_queue: VecDeque<String>,
    sending: bool,
    had_fatal_send_error: bool,
    last_seen_at: i64,
    last_ping_sent_at: Option<i64>,
    heartbeat_handle: Option<JoinHandle<()>>,
    pong_deadline_handle: Option<JoinHandle<()>>,
}

/// One live attached client. Held as `Arc<Connection>` in the hub's
/// registry and by the background flush/heartbeat tasks it spawns.
pub struct Connection {
    pub client_id: String,
    pub account_id: String,
    pub device_id: String,
    socket: Arc<dyn Socket>,
    max_queue_length: usize,
    outbound_log_limit: usize,
    inner: Mutex<ConnectionInner>,
}

impl Connection {
    pub fn new(
        client_id: String,
        account_id: String,
        device_id: String,
        socket: Arc<dyn Socket>,
        resume_token: Uuid,
        resume_token_expires_at: i64,
        max_queue_length: usize,
        outbound_log_limit: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            account_id,
            device_id,
            socket,
            max_queue_length,
            outbound_log_limit,
            inner: Mutex::new(ConnectionInner {
                resume_token,
                resume_token_expires_at,
                server_sequence: 0,
                client_sequence: 0,
                in_flight: HashSet::new(),
                outbound_log: VecDeque::new(),
                send_queue: VecDeque::new(),
                sending: false,
                had_fatal_send_error: false,
                last_seen_at: now_ms(),
                last_ping_sent_at: None,
                heartbeat_handle: None,
                pong_deadline_handle: None,
            }),
        })
    }

    pub fn socket_state(&self) -> SocketState {
        self.socket.state()
    }

    pub fn buffered_amount(&self) -> usize {
        self.socket.buffered_amount()
    }

    pub async fn resume_token(&self) -> Uuid {
        self.inner.lock().await.resume_token
    }

    pub async fn resume_token_expires_at(&self) -> i64 {
        self.inner.lock().await.resume_token_expires_at
    }

    pub async fn server_sequence(&self) -> u64 {
        self.inner.lock().await.server_sequence
    }

    pub async fn outbound_log_snapshot(&self) -> Vec<OutboundFrame> {
        self.inner.lock().await.outbound_log.iter().cloned().collect()
    }

    pub async fn touch_last_seen(&self) {
        self.inner.lock().await.last_seen_at = now_ms();
    }

    pub async fn last_seen_at(&self) -> i64 {
        self.inner.lock().await.last_seen_at
    }

    /// Rotates the connection's live resume token, returning the previous
    /// one so the caller can decide whether to drop any persisted state
    /// filed under it.
    pub async fn rotate_resume_token(&self, new_token: Uuid, expires_at: i64) -> Uuid {
        let mut inner = self.inner.lock().await;
        let previous = inner.resume_token;
        inner.resume_token = new_token;
        inner.resume_token_expires_at = expires_at;
        previous
    }

    /// Grafts a cross-session-recovered outbound log and sequence onto this
    /// connection, replacing whatever (empty, for a freshly registered
    /// connection) state it already held.
    pub async fn graft_recovered_state(&self, server_sequence: u64, frames: Vec<OutboundFrame>) {
        let mut inner = self.inner.lock().await;
        inner.server_sequence = server_sequence;
        inner.outbound_log = frames.into_iter().collect();
    }

    /// Appends a freshly broadcast frame to the outbound log, truncating to
    /// `outbound_log_limit` oldest-first, and returns the assigned `seq`.
    pub async fn append_outbound(&self, payload: String) -> u64 {
        let mut inner = self.inner.lock().await;
        inner.server_sequence += 1;
        let seq = inner.server_sequence;
        inner.outbound_log.push_back(OutboundFrame { seq, payload });
        while inner.outbound_log.len() > self.outbound_log_limit {
            inner.outbound_log.pop_front();
        }
        seq
    }

    /// Step 7 of the frame handler: if `envelope_id` is already in flight,
    /// this is a duplicate and the caller should ack `rejected` without
    /// touching `client_sequence`. Otherwise it is recorded in flight and
    /// `client_sequence` is incremented so the caller can ack `accepted`
    /// with the new value; the id stays in flight until `clear_in_flight`
    /// is called after that ack is emitted (step 8), so a second copy of
    /// the same envelope arriving mid-ack still sees it as in flight.
    pub async fn mark_in_flight_and_bump_sequence(&self, envelope_id: Uuid) -> Option<u64> {
        let mut inner = self.inner.lock().await;
        if inner.in_flight.contains(&envelope_id) {
            return None;
        }
        inner.in_flight.insert(envelope_id);
        inner.client_sequence += 1;
        Some(inner.client_sequence)
    }

    pub async fn clear_in_flight(&self, envelope_id: Uuid) {
        self.inner.lock().await.in_flight.remove(&envelope_id);
    }

    /// Appends `payload` to the FIFO and ensures exactly one flush worker is
    /// running. Drops silently once `had_fatal_send_error` is latched; closes
    /// the connection with `overloaded` instead of enqueuing past the cap.
    pub async fn enqueue(self: &Arc<Self>, payload: String) {
        let spawn = {
            let mut inner = self.inner.lock().await;
            if inner.had_fatal_send_error {
                return;
            }
            if inner.send_queue.len() >= self.max_queue_length {
                drop(inner);
                metrics::record(&MetricEvent::Overloaded {
                    account_id: &self.account_id,
                    device_id: &self.device_id,
                });
                self.close(close_code::OVERLOADED, close_reason::OVERLOADED).await;
                return;
            }
            inner.send_queue.push_back(payload);
            let spawn = !inner.sending;
            if spawn {
                inner.sending = true;
            }
            spawn
        };
        if spawn {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.flush().await });
        }
    }

    /// Single-worker drain loop: pops one payload at a time and hands it to
    /// the socket, stopping (and clearing `sending`) once the queue empties
    /// or a fatal error latches it shut.
    async fn flush(self: Arc<Self>) {
        loop {
            let payload = {
                let mut inner = self.inner.lock().await;
                if inner.had_fatal_send_error || inner.send_queue.is_empty() {
                    inner.sending = false;
                    None
                } else {
                    inner.send_queue.pop_front()
                }
            };
            let Some(payload) = payload else { break };
            match self.socket.send_text(payload).await {
                Ok(()) => {
                    metrics::record(&MetricEvent::FrameSent { account_id: &self.account_id });
                }
                Err(err) => {
                    self.handle_send_failure(err).await;
                    break;
                }
            }
        }
    }

    /// Latches `had_fatal_send_error`, drains the queue, and closes with
    /// `send_failure`. Idempotent: a second call after the latch is already
    /// set is a no-op, since `flush` never runs again once latched.
    async fn handle_send_failure(&self, err: SocketError) {
        {
            let mut inner = self.inner.lock().await;
            if inner.had_fatal_send_error {
                return;
            }
            inner.had_fatal_send_error = true;
            inner.send_queue.clear();
        }
        metrics::record(&MetricEvent::SendError {
            account_id: &self.account_id,
            device_id: &self.device_id,
            name: sanitized_error_name(&err),
        });
        self.close(close_code::SEND_FAILURE, close_reason::SEND_FAILURE).await;
    }

    /// Unconditionally closes the underlying socket and emits `ws_closed`.
    pub async fn close(&self, code: u16, reason: &str) {
        let _ = self.socket.close(code, reason.to_owned()).await;
        metrics::record(&MetricEvent::Closed {
            account_id: &self.account_id,
            device_id: &self.device_id,
            code,
            reason,
        });
    }

    pub async fn terminate(&self) {
        self.socket.terminate().await;
    }

    pub async fn send_ping(&self) -> Result<(), SocketError> {
        self.socket.send_ping().await
    }

    /// Records a pong: updates `last_seen_at`, and if a ping was
    /// outstanding, observes its latency and clears it. Returns the
    /// observed latency in milliseconds, if any.
    pub async fn record_pong(&self) -> Option<f64> {
        let mut inner = self.inner.lock().await;
        let now = now_ms();
        inner.last_seen_at = now;
        inner.last_ping_sent_at.take().map(|sent| (now - sent) as f64)
    }

    pub async fn mark_ping_sent(&self) {
        self.inner.lock().await.last_ping_sent_at = Some(now_ms());
    }

    pub async fn has_pending_ping(&self) -> bool {
        self.inner.lock().await.last_ping_sent_at.is_some()
    }

    pub async fn set_heartbeat_handle(&self, handle: JoinHandle<()>) {
        let mut inner = self.inner.lock().await;
        if let Some(old) = inner.heartbeat_handle.replace(handle) {
            old.abort();
        }
    }

    pub async fn set_pong_deadline_handle(&self, handle: Option<JoinHandle<()>>) {
        let mut inner = self.inner.lock().await;
        if let Some(old) = inner.pong_deadline_handle.take() {
            old.abort();
        }
        inner.pong_deadline_handle = handle;
    }

    pub async fn cancel_timers(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(h) = inner.heartbeat_handle.take() {
            h.abort();
        }
        if let Some(h) = inner.pong_deadline_handle.take() {
            h.abort();
        }
    }
}

fn sanitized_error_name(err: &SocketError) -> &'static str {
    // Only a fixed, non-identifying label ever reaches metrics/logs; the
    // raw message (which may embed peer addresses) is logged separately at
    // the call site, never recorded as a label value.
    let _ = err;
    "SocketError"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::test_support::FakeSocket;

    fn make_connection(socket: Arc<FakeSocket>) -> Arc<Connection> {
        Connection::new(
            "client-1".to_owned(),
            "acct-1".to_owned(),
            "device-1".to_owned(),
            socket,
            Uuid::new_v4(),
            now_ms() + 900_000,
            1024,
            500,
        )
    }

    #[tokio::test]
    async fn enqueue_flushes_in_fifo_order() {
        let socket = Arc::new(FakeSocket::new());
        let conn = make_connection(Arc::clone(&socket) as Arc<dyn Socket>);
        // Note: FakeSocket needs an explicit `dyn Socket` coercion above,
        // but we still hold `socket` concretely for assertions below.
        conn.enqueue("one".to_owned()).await;
        conn.enqueue("two".to_owned()).await;
        conn.enqueue("three".to_owned()).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(socket.sent_frames(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn overload_closes_without_enqueuing() {
        let socket = Arc::new(FakeSocket::new());
        let conn = Connection::new(
            "client-1".to_owned(),
            "acct-1".to_owned(),
            "device-1".to_owned(),
            Arc::clone(&socket) as Arc<dyn Socket>,
            Uuid::new_v4(),
            now_ms() + 900_000,
            0,
            500,
        );
        conn.enqueue("dropped".to_owned()).await;
        assert!(socket.sent_frames().is_empty());
        assert_eq!(*socket.closed_with.lock().unwrap(), Some((1013, "overloaded".to_owned())));
    }

    #[tokio::test]
    async fn fatal_send_error_latches_and_drains_queue() {
        let socket = Arc::new(FakeSocket::new());
        socket.fail_next_send.store(true, std::sync::atomic::Ordering::Release);
        let conn = make_connection(Arc::clone(&socket) as Arc<dyn Socket>);
        conn.enqueue("boom".to_owned()).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(*socket.closed_with.lock().unwrap(), Some((1011, "send_failure".to_owned())));

        // Once latched, further enqueues are dropped silently and never reach
        // the socket.
        conn.enqueue("never sent".to_owned()).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(socket.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn outbound_log_truncates_to_limit_oldest_first() {
        let socket = Arc::new(FakeSocket::new());
        let conn = Connection::new(
            "client-1".to_owned(),
            "acct-1".to_owned(),
            "device-1".to_owned(),
            socket,
            Uuid::new_v4(),
            now_ms() + 900_000,
            1024,
            3,
        );
        for i in 0..5 {
            conn.append_outbound(format!("payload-{i}")).await;
        }
        let log = conn.outbound_log_snapshot().await;
        assert_eq!(log.len(), 3);
        assert_eq!(log.iter().map(|f| f.seq).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn duplicate_envelope_id_is_rejected_until_cleared() {
        let socket = Arc::new(FakeSocket::new());
        let conn = make_connection(socket);
        let id = Uuid::new_v4();
        assert_eq!(conn.mark_in_flight_and_bump_sequence(id).await, Some(1));
        // Still in flight: a second copy of the same envelope is a duplicate.
        assert_eq!(conn.mark_in_flight_and_bump_sequence(id).await, None);
        conn.clear_in_flight(id).await;
        // Once cleared, the same id is accepted again as a fresh envelope.
        assert_eq!(conn.mark_in_flight_and_bump_sequence(id).await, Some(2));
    }
}
