//! Hub state (C5): the registry of live connections plus the handful of
//! helpers (`broadcast`, `safe_send`, `safe_send_with_backpressure`,
//! `schedule_heartbeat`, `next_resume_token`, `persist_snapshot`) every other
//! component calls into. Registry mutations go through a
//! `tokio::sync::RwLock`; everything else delegates to the per-connection
//! lock inside `Connection` itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hub_protocol::{close_code, close_reason, Envelope, ResumeState};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::codec;
use crate::config::HubConfig;
use crate::connection::{now_ms, Connection};
use crate::error::HubError;
use crate::metrics::{self, MetricEvent};
use crate::rate_limit::RateLimiter;
use crate::resume_store::ResumeStore;
use crate::socket::SocketState;

pub struct Hub {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    pub config: HubConfig,
    resume_store: Arc<dyn ResumeStore>,
    authenticator: Arc<dyn Authenticator>,
    connection_rate_limiter: Option<Arc<dyn RateLimiter>>,
    message_rate_limiter: Option<Arc<dyn RateLimiter>>,
}

impl Hub {
    pub fn new(
        config: HubConfig,
        resume_store: Arc<dyn ResumeStore>,
        authenticator: Arc<dyn Authenticator>,
        connection_rate_limiter: Option<Arc<dyn RateLimiter>>,
        message_rate_limiter: Option<Arc<dyn RateLimiter>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            config,
            resume_store,
            authenticator,
            connection_rate_limiter,
            message_rate_limiter,
        })
    }

    pub fn resume_store(&self) -> &Arc<dyn ResumeStore> {
        &self.resume_store
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }

    pub fn connection_rate_limiter(&self) -> Option<&Arc<dyn RateLimiter>> {
        self.connection_rate_limiter.as_ref()
    }

    pub fn message_rate_limiter(&self) -> Option<&Arc<dyn RateLimiter>> {
        self.message_rate_limiter.as_ref()
    }

    pub async fn insert_connection(&self, conn: Arc<Connection>) {
        self.connections.write().await.insert(conn.client_id.clone(), conn);
    }

    pub async fn get_connection(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(client_id).cloned()
    }

    pub async fn remove_connection(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.connections.write().await.remove(client_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// `{token: new UUIDv4, expiresAt: now + resumeTokenTtlMs}`.
    pub fn next_resume_token(&self) -> (Uuid, i64) {
        (Uuid::new_v4(), now_ms() + self.config.resume_token_ttl_ms)
    }

    /// Writes `(resumeToken, accountId, deviceId, serverSequence, expiresAt,
    /// outboundLog copy)` to the resume store.
    pub async fn persist_snapshot(&self, conn: &Connection) -> Result<(), HubError> {
        let state = ResumeState {
            resume_token: conn.resume_token().await,
            account_id: conn.account_id.clone(),
            device_id: conn.device_id.clone(),
            last_server_seq: conn.server_sequence().await,
            expires_at: conn.resume_token_expires_at().await,
            outbound_frames: conn.outbound_log_snapshot().await,
        };
        self.resume_store.persist(state).await
    }

    /// Reads the socket's `bufferedAmount`: refuses silently if not `Open`;
    /// closes with `overloaded` (1013) if over `maxBufferedBytes`; otherwise
    /// enqueues. Used for fresh broadcasts and acks, where losing delivery
    /// order is unacceptable.
    pub async fn safe_send(&self, conn: &Arc<Connection>, payload: String) {
        if conn.socket_state() != SocketState::Open {
            return;
        }
        if conn.buffered_amount() > self.config.max_buffered_bytes {
            metrics::record(&MetricEvent::Overloaded { account_id: &conn.account_id, device_id: &conn.device_id });
            conn.close(close_code::OVERLOADED, close_reason::OVERLOADED).await;
            return;
        }
        conn.enqueue(payload).await;
    }

    /// Same overload check as `safe_send`, but never closes the connection:
    /// returns `false` to signal the caller (the replay engine) to halt
    /// further sends instead.
    pub async fn safe_send_with_backpressure(&self, conn: &Arc<Connection>, payload: String) -> bool {
        if conn.socket_state() != SocketState::Open {
            return false;
        }
        if conn.buffered_amount() > self.config.max_buffered_bytes {
            return false;
        }
        conn.enqueue(payload).await;
        true
    }

    /// Serializes `envelope` once, then for each live connection: appends it
    /// to the outbound log (bumping `serverSequence` and truncating to
    /// `outboundLogLimit`), enqueues it via `safe_send`, and persists a
    /// snapshot. Every live connection gets appended-to and enqueued
    /// unconditionally, even if persisting the snapshot fails for an
    /// earlier one — a persist failure must never cause later connections
    /// in the registry to silently miss the broadcast, and must never
    /// un-deliver it from connections already enqueued before the failure.
    /// Any persist failures are logged and surfaced as a single aggregate
    /// error only once every connection has been served.
    pub async fn broadcast(&self, envelope: Envelope) -> Result<(), HubError> {
        let payload = codec::encode_frame(&envelope);
        let targets: Vec<Arc<Connection>> = self.connections.read().await.values().cloned().collect();
        let mut first_persist_error = None;
        for conn in targets {
            conn.append_outbound(payload.clone()).await;
            self.safe_send(&conn, payload.clone()).await;
            if let Err(err) = self.persist_snapshot(&conn).await {
                warn!(error = %err, client_id = %conn.client_id, "failed to persist post-broadcast snapshot");
                if first_persist_error.is_none() {
                    first_persist_error = Some(err);
                }
            }
        }
        match first_persist_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Cancels any existing timer and arms a fresh one `heartbeat_interval_ms`
    /// out. On firing: if the connection has been idle for at least the
    /// interval, sends a keepalive ping and arms a second, `interval/2` timer
    /// that terminates the connection if no pong cancels it first; if the
    /// connection was recently active, simply re-arms the primary timer.
    pub async fn schedule_heartbeat(self: &Arc<Self>, conn: Arc<Connection>) {
        let hub = Arc::clone(self);
        let interval_ms = self.config.heartbeat_interval_ms;
        let task_conn = Arc::clone(&conn);
        let handle = tokio::spawn(async move {
            hub.heartbeat_fire(task_conn, interval_ms).await;
        });
        conn.set_heartbeat_handle(handle).await;
    }

    async fn heartbeat_fire(self: Arc<Self>, conn: Arc<Connection>, interval_ms: i64) {
        tokio::time::sleep(Duration::from_millis(interval_ms.max(0) as u64)).await;
        let idle_for = now_ms() - conn.last_seen_at().await;
        if idle_for < interval_ms {
            self.schedule_heartbeat(conn).await;
            return;
        }

        conn.mark_ping_sent().await;
        if conn.send_ping().await.is_err() {
            self.terminate_for_heartbeat(&conn).await;
            return;
        }

        let half_interval = interval_ms / 2;
        let hub = Arc::clone(&self);
        let deadline_conn = Arc::clone(&conn);
        let deadline_handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(half_interval.max(0) as u64)).await;
            if deadline_conn.has_pending_ping().await {
                hub.terminate_for_heartbeat(&deadline_conn).await;
            }
        });
        conn.set_pong_deadline_handle(Some(deadline_handle)).await;
    }

    async fn terminate_for_heartbeat(&self, conn: &Arc<Connection>) {
        conn.terminate().await;
        self.remove_connection(&conn.client_id).await;
        metrics::record(&MetricEvent::HeartbeatTerminate {
            account_id: &conn.account_id,
            device_id: &conn.device_id,
        });
        info!(client_id = %conn.client_id, account_id = %conn.account_id, "heartbeat terminated connection");
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use crate::auth::StaticTokenAuthenticator;
    use crate::resume_store::InMemoryResumeStore;
    use std::collections::HashMap as StdHashMap;

    pub fn empty_hub() -> Arc<Hub> {
        Hub::new(
            HubConfig::default(),
            InMemoryResumeStore::new(),
            Arc::new(StaticTokenAuthenticator::new(StdHashMap::new())),
            None,
            None,
        )
    }
}
