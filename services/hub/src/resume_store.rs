//! Resume store (C3): durable mapping `resume_token -> ResumeState`, with
//! lazy TTL expiry checked by the caller at load time rather than a
//! background sweep. Two implementations share the same contract: an
//! in-memory store for tests/single-process embedding, and a Postgres-backed
//! store for production, matching the spec's canonical "Durable KV with TTL"
//! shape with a real database behind it.

use std::collections::HashMap;
use std::sync::Arc;

use hub_protocol::ResumeState;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::connection::now_ms;
use crate::error::HubError;

/// `load`/`persist`/`drop` over resume tokens. `load` returns `None` for
/// unknown or (if the backend is lazily-expiring) expired tokens; ownership
/// of a token is never checked here — callers (the resume engine) compare
/// `account_id`/`device_id` themselves.
#[async_trait::async_trait]
pub trait ResumeStore: Send + Sync {
    async fn load(&self, token: Uuid) -> Result<Option<ResumeState>, HubError>;
    async fn persist(&self, state: ResumeState) -> Result<(), HubError>;
    async fn drop_token(&self, token: Uuid) -> Result<(), HubError>;
}

/// In-memory resume store: a plain mapping with no TTL cleanup thread.
/// Expiry is left entirely to the caller, matching the spec's "no
/// background sweep" in-memory variant.
#[derive(Default)]
pub struct InMemoryResumeStore {
    states: Mutex<HashMap<Uuid, ResumeState>>,
}

impl InMemoryResumeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait::async_trait]
impl ResumeStore for InMemoryResumeStore {
    async fn load(&self, token: Uuid) -> Result<Option<ResumeState>, HubError> {
        Ok(self.states.lock().await.get(&token).cloned())
    }

    async fn persist(&self, state: ResumeState) -> Result<(), HubError> {
        self.states.lock().await.insert(state.resume_token, state);
        Ok(())
    }

    async fn drop_token(&self, token: Uuid) -> Result<(), HubError> {
        self.states.lock().await.remove(&token);
        Ok(())
    }
}

/// Postgres-backed resume store: one row per token in `resume_states`,
/// `outbound_frames` stored as a JSON column. `load` enforces TTL lazily —
/// a row past `expires_at` is deleted on read and reported as absent, so
/// stale rows never accumulate unboundedly even with no background sweep,
/// matching the in-memory variant's externally observable behavior.
pub struct PostgresResumeStore {
    pool: PgPool,
}

impl PostgresResumeStore {
    pub fn new(pool: PgPool) -> Arc<Self> {
        Arc::new(Self { pool })
    }
}

#[async_trait::async_trait]
impl ResumeStore for PostgresResumeStore {
    async fn load(&self, token: Uuid) -> Result<Option<ResumeState>, HubError> {
        let row = sqlx::query!(
            r#"SELECT resume_token, account_id, device_id, last_server_seq, expires_at, outbound_frames
               FROM resume_states
               WHERE resume_token = $1"#,
            token
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        if row.expires_at < now_ms() {
            self.drop_token(token).await?;
            return Ok(None);
        }
        let outbound_frames = serde_json::from_value(row.outbound_frames)?;
        Ok(Some(ResumeState {
            resume_token: row.resume_token,
            account_id: row.account_id,
            device_id: row.device_id,
            last_server_seq: row.last_server_seq as u64,
            expires_at: row.expires_at,
            outbound_frames,
        }))
    }

    async fn persist(&self, state: ResumeState) -> Result<(), HubError> {
        let frames_json = serde_json::to_value(&state.outbound_frames)?;
        sqlx::query!(
            r#"INSERT INTO resume_states (resume_token, account_id, device_id, last_server_seq, expires_at, outbound_frames)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (resume_token) DO UPDATE SET
                 account_id = EXCLUDED.account_id,
                 device_id = EXCLUDED.device_id,
                 last_server_seq = EXCLUDED.last_server_seq,
                 expires_at = EXCLUDED.expires_at,
                 outbound_frames = EXCLUDED.outbound_frames"#,
            state.resume_token,
            state.account_id,
            state.device_id,
            state.last_server_seq as i64,
            state.expires_at,
            frames_json,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn drop_token(&self, token: Uuid) -> Result<(), HubError> {
        sqlx::query!("DELETE FROM resume_states WHERE resume_token = $1", token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_protocol::OutboundFrame;

    fn sample_state(token: Uuid) -> ResumeState {
        ResumeState {
            resume_token: token,
            account_id: "acct-1".to_owned(),
            device_id: "device-1".to_owned(),
            last_server_seq: 41,
            expires_at: now_ms() + 900_000,
            outbound_frames: vec![OutboundFrame { seq: 41, payload: "{}".to_owned() }],
        }
    }

    #[tokio::test]
    async fn persist_then_load_round_trips() {
        let store = InMemoryResumeStore::new();
        let token = Uuid::new_v4();
        store.persist(sample_state(token)).await.unwrap();
        let loaded = store.load(token).await.unwrap().expect("should be present");
        assert_eq!(loaded, sample_state(token));
    }

    #[tokio::test]
    async fn load_of_unknown_token_is_none() {
        let store = InMemoryResumeStore::new();
        assert_eq!(store.load(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn drop_is_idempotent_and_makes_token_unloadable() {
        let store = InMemoryResumeStore::new();
        let token = Uuid::new_v4();
        store.persist(sample_state(token)).await.unwrap();
        store.drop_token(token).await.unwrap();
        assert_eq!(store.load(token).await.unwrap(), None);
        // Second drop of an already-absent token must not error.
        store.drop_token(token).await.unwrap();
    }
}
