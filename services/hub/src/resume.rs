//! Resume / replay engine (C8): validates a `resume` envelope, resolves
//! cross-session recovery vs. same-session rotation, rotates the token,
//! and replays the outbound log in backpressure-aware batches.

use std::sync::Arc;

use hub_protocol::{close_code, close_reason, Envelope, OutboundFrame, ResumeAck};
use tracing::{error, warn};

use crate::codec;
use crate::connection::{now_ms, Connection};
use crate::hub::Hub;
use crate::metrics::{self, MetricEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResumeOutcome {
    pub replay_count: u64,
    pub batches: u64,
}

/// Runs the full protocol in §4.8. Returns `{replayCount, batches}` even
/// on a rejected resume (always zero in that case), matching the
/// operation's documented return shape.
pub async fn handle_resume(hub: &Arc<Hub>, conn: &Arc<Connection>, envelope: Envelope) -> ResumeOutcome {
    let Envelope::Resume { payload, .. } = envelope else {
        conn.close(close_code::PROTOCOL_ERROR, close_reason::INVALID_RESUME).await;
        return ResumeOutcome::default();
    };

    let presented_token = payload.resume_token;
    let current_token = conn.resume_token().await;

    if presented_token == current_token {
        // Same-session rotation. A token that outlived its own TTL without
        // the client reconnecting is dropped best-effort; the rotation
        // below always issues a fresh one regardless.
        if now_ms() > conn.resume_token_expires_at().await {
            if let Err(err) = hub.resume_store().drop_token(presented_token).await {
                warn!(error = %err, "failed to drop expired same-session resume token (best-effort)");
            }
        }
    } else {
        // Cross-session recovery.
        let loaded = match hub.resume_store().load(presented_token).await {
            Ok(state) => state,
            Err(err) => {
                error!(error = %err, "resume store load failed");
                conn.close(close_code::POLICY, close_reason::INVALID_TOKEN).await;
                return ResumeOutcome::default();
            }
        };
        let Some(state) = loaded else {
            conn.close(close_code::POLICY, close_reason::INVALID_TOKEN).await;
            return ResumeOutcome::default();
        };
        if state.expires_at < now_ms() {
            if let Err(err) = hub.resume_store().drop_token(presented_token).await {
                warn!(error = %err, "failed to drop expired resume token (best-effort)");
            }
            conn.close(close_code::POLICY, close_reason::EXPIRED_TOKEN).await;
            return ResumeOutcome::default();
        }
        if state.account_id != conn.account_id || state.device_id != conn.device_id {
            conn.close(close_code::POLICY, close_reason::TOKEN_CONFLICT).await;
            return ResumeOutcome::default();
        }
        conn.graft_recovered_state(state.last_server_seq, state.outbound_frames).await;
        // Single-use: drop as part of this same logical step so a racing
        // second recovery under the same token can never diverge.
        if let Err(err) = hub.resume_store().drop_token(presented_token).await {
            warn!(error = %err, "failed to drop recovered resume token");
        }
    }

    metrics::record(&MetricEvent::ReplayStart { account_id: &conn.account_id });

    let (new_token, expires_at) = hub.next_resume_token();
    conn.rotate_resume_token(new_token, expires_at).await;

    let from_seq = payload.last_client_seq + 1;
    let resume_ack = ResumeAck { from_seq, expires_in_ms: expires_at - now_ms(), resume_token: new_token };
    hub.safe_send(conn, codec::encode_frame(&resume_ack)).await;

    let frames_to_replay: Vec<OutboundFrame> =
        conn.outbound_log_snapshot().await.into_iter().filter(|f| f.seq >= from_seq).collect();

    let mut replay_count: u64 = 0;
    let mut batches: u64 = 0;
    let mut halted_by_backpressure = false;

    'batches: for batch in frames_to_replay.chunks(hub.config.max_replay_batch_size.max(1)) {
        batches += 1;
        metrics::record(&MetricEvent::ReplayBatchSent { account_id: &conn.account_id, batch_len: batch.len() });
        for frame in batch {
            if hub.safe_send_with_backpressure(conn, frame.payload.clone()).await {
                replay_count += 1;
            } else {
                metrics::record(&MetricEvent::ReplayBackpressureHits { account_id: &conn.account_id });
                halted_by_backpressure = true;
                break 'batches;
            }
        }
    }

    if halted_by_backpressure {
        conn.close(close_code::OVERLOADED, close_reason::OVERLOADED).await;
    }

    if let Err(err) = hub.persist_snapshot(conn).await {
        warn!(error = %err, "failed to persist post-resume snapshot");
    }
    metrics::record(&MetricEvent::ResumeTokenRotated {
        account_id: &conn.account_id,
        redacted_token: &metrics::redact_token(&new_token),
    });
    metrics::record(&MetricEvent::ReplayComplete { account_id: &conn.account_id, replay_count, batches });

    ResumeOutcome { replay_count, batches }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthClaims, Authenticator};
    use crate::config::HubConfig;
    use crate::resume_store::{InMemoryResumeStore, ResumeStore};
    use crate::socket::test_support::FakeSocket;
    use crate::socket::Socket;
    use axum::http::HeaderMap;
    use hub_protocol::{MsgPayload, ResumePayload, ResumeState, ServerFrame};
    use uuid::Uuid;

    struct AlwaysAuth;
    #[async_trait::async_trait]
    impl Authenticator for AlwaysAuth {
        async fn authenticate(&self, _headers: &HeaderMap, _client_id: &str) -> Option<AuthClaims> {
            Some(AuthClaims { account_id: "acct-1".to_owned(), device_id: "device-1".to_owned() })
        }
    }

    fn test_hub() -> Arc<Hub> {
        Hub::new(HubConfig::default(), InMemoryResumeStore::new(), Arc::new(AlwaysAuth), None, None)
    }

    async fn registered(hub: &Arc<Hub>, client_id: &str) -> (Arc<Connection>, Arc<FakeSocket>) {
        let socket = Arc::new(FakeSocket::new());
        let conn = crate::lifecycle::register(hub, Arc::clone(&socket) as Arc<dyn Socket>, client_id.to_owned(), &HeaderMap::new())
            .await
            .unwrap();
        (conn, socket)
    }

    fn resume_envelope(token: Uuid, last_client_seq: u64) -> Envelope {
        Envelope::Resume { id: Uuid::new_v4(), size: 40, payload: ResumePayload { resume_token: token, last_client_seq } }
    }

    #[tokio::test]
    async fn cross_session_recovery_replays_the_persisted_log_and_rotates_the_token() {
        let hub = test_hub();
        let (conn, _socket) = registered(&hub, "client-1").await;
        let old_token = conn.resume_token().await;

        for i in 0..5u64 {
            let env = Envelope::Msg { id: Uuid::new_v4(), size: 5, payload: MsgPayload { seq: i, data: None } };
            hub.broadcast(env).await.unwrap();
        }

        let new_socket = Arc::new(FakeSocket::new());
        let new_conn = Connection::new(
            "client-1".to_owned(),
            "acct-1".to_owned(),
            "device-1".to_owned(),
            Arc::clone(&new_socket) as Arc<dyn Socket>,
            Uuid::new_v4(),
            now_ms() + 900_000,
            hub.config.max_queue_length,
            hub.config.outbound_log_limit,
        );
        hub.insert_connection(Arc::clone(&new_conn)).await;

        let outcome = handle_resume(&hub, &new_conn, resume_envelope(old_token, 0)).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(outcome.replay_count, 5);
        assert_eq!(outcome.batches, 1);

        let frames = new_socket.sent_frames();
        assert_eq!(frames.len(), 6);
        let first: ServerFrame = serde_json::from_str(&frames[0]).unwrap();
        let rotated = match first {
            ServerFrame::ResumeAck(ack) => {
                assert_ne!(ack.resume_token, old_token);
                ack.resume_token
            }
            other => panic!("expected resume_ack first, got {other:?}"),
        };
        assert_eq!(new_conn.resume_token().await, rotated);

        // Single-use: the old token is no longer loadable.
        assert_eq!(hub.resume_store().load(old_token).await.unwrap(), None);
    }

    #[tokio::test]
    async fn replay_of_100_frames_splits_into_5_batches_of_20() {
        let mut config = HubConfig::default();
        config.max_replay_batch_size = 20;
        let hub = Hub::new(config, InMemoryResumeStore::new(), Arc::new(AlwaysAuth), None, None);
        let (conn, _socket) = registered(&hub, "client-1").await;
        let old_token = conn.resume_token().await;

        for i in 0..100u64 {
            let env = Envelope::Msg { id: Uuid::new_v4(), size: 5, payload: MsgPayload { seq: i, data: None } };
            hub.broadcast(env).await.unwrap();
        }

        let new_socket = Arc::new(FakeSocket::new());
        let new_conn = Connection::new(
            "client-1".to_owned(),
            "acct-1".to_owned(),
            "device-1".to_owned(),
            Arc::clone(&new_socket) as Arc<dyn Socket>,
            Uuid::new_v4(),
            now_ms() + 900_000,
            hub.config.max_queue_length,
            hub.config.outbound_log_limit,
        );
        hub.insert_connection(Arc::clone(&new_conn)).await;

        let outcome = handle_resume(&hub, &new_conn, resume_envelope(old_token, 0)).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(outcome.replay_count, 100);
        assert_eq!(outcome.batches, 5);

        let frames = new_socket.sent_frames();
        // resume_ack plus 100 replayed frames, in order.
        assert_eq!(frames.len(), 101);
        for (i, raw) in frames.iter().skip(1).enumerate() {
            let parsed: ServerFrame = serde_json::from_str(raw).unwrap();
            match parsed {
                ServerFrame::Envelope(Envelope::Msg { payload, .. }) => assert_eq!(payload.seq, i as u64),
                other => panic!("expected a replayed msg at index {i}, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn expired_cross_session_token_closes_without_resume_ack() {
        let hub = test_hub();
        let (conn, socket) = registered(&hub, "client-1").await;
        let token = Uuid::new_v4();
        hub.resume_store()
            .persist(ResumeState {
                resume_token: token,
                account_id: "acct-1".to_owned(),
                device_id: "device-1".to_owned(),
                last_server_seq: 0,
                expires_at: now_ms() - 1,
                outbound_frames: vec![],
            })
            .await
            .unwrap();

        let outcome = handle_resume(&hub, &conn, resume_envelope(token, 0)).await;

        assert_eq!(outcome, ResumeOutcome::default());
        assert_eq!(*socket.closed_with.lock().unwrap(), Some((1008, "expired_token".to_owned())));
        assert!(socket.sent_frames().is_empty());
        assert_eq!(hub.resume_store().load(token).await.unwrap(), None);
    }

    #[tokio::test]
    async fn token_conflict_closes_and_keeps_the_persisted_state() {
        let hub = test_hub();
        let (conn, socket) = registered(&hub, "client-1").await;
        let token = Uuid::new_v4();
        hub.resume_store()
            .persist(ResumeState {
                resume_token: token,
                account_id: "someone-else".to_owned(),
                device_id: "device-9".to_owned(),
                last_server_seq: 0,
                expires_at: now_ms() + 900_000,
                outbound_frames: vec![],
            })
            .await
            .unwrap();

        handle_resume(&hub, &conn, resume_envelope(token, 0)).await;

        assert_eq!(*socket.closed_with.lock().unwrap(), Some((1008, "token_conflict".to_owned())));
        assert!(hub.resume_store().load(token).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_token_closes_invalid_token() {
        let hub = test_hub();
        let (conn, socket) = registered(&hub, "client-1").await;
        handle_resume(&hub, &conn, resume_envelope(Uuid::new_v4(), 0)).await;
        assert_eq!(*socket.closed_with.lock().unwrap(), Some((1008, "invalid_token".to_owned())));
    }

    #[tokio::test]
    async fn backpressure_halts_replay_and_closes_overloaded() {
        let mut config = HubConfig::default();
        config.max_buffered_bytes = 0;
        let hub = Hub::new(config, InMemoryResumeStore::new(), Arc::new(AlwaysAuth), None, None);
        let (conn, socket) = registered(&hub, "client-1").await;
        let old_token = conn.resume_token().await;

        for i in 0..3u64 {
            let env = Envelope::Msg { id: Uuid::new_v4(), size: 5, payload: MsgPayload { seq: i, data: None } };
            hub.broadcast(env).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        socket.sent.lock().unwrap().clear();

        socket.set_buffered_amount(1024);
        let outcome = handle_resume(&hub, &conn, resume_envelope(old_token, 0)).await;

        assert_eq!(outcome.replay_count, 0);
        assert_eq!(*socket.closed_with.lock().unwrap(), Some((1013, "overloaded".to_owned())));
    }
}
