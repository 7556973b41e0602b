use std::env;

use crate::error::HubError;

/// Which `ResumeStore` backend to build at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStoreBackend {
    Memory,
    Postgres,
}

/// Every tunable the hub reads from its own environment. These are the
/// hub's own limits and listen address, not a central configuration
/// service — the spec's "configuration loading" non-goal refers to that
/// external service, not to these.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub bind_addr: String,
    pub log_level: String,
    pub resume_store: ResumeStoreBackend,
    pub database_url: Option<String>,
    pub max_buffered_bytes: usize,
    pub max_queue_length: usize,
    pub outbound_log_limit: usize,
    pub heartbeat_interval_ms: i64,
    pub resume_token_ttl_ms: i64,
    pub max_replay_batch_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_owned(),
            log_level: "info".to_owned(),
            resume_store: ResumeStoreBackend::Memory,
            database_url: None,
            max_buffered_bytes: 5 * 1024 * 1024,
            max_queue_length: 1024,
            outbound_log_limit: 500,
            heartbeat_interval_ms: 60_000,
            resume_token_ttl_ms: 900_000,
            max_replay_batch_size: 100,
        }
    }
}

impl HubConfig {
    /// Builds config from the process environment, falling back to the
    /// spec's defaults for anything unset, matching the teacher's
    /// `env::var(...).unwrap_or_else(...)` convention in `main.rs`.
    pub fn from_env() -> Result<Self, HubError> {
        let defaults = Self::default();

        let resume_store = match env::var("HUB_RESUME_STORE") {
            Ok(v) if v.eq_ignore_ascii_case("postgres") => ResumeStoreBackend::Postgres,
            Ok(v) if v.eq_ignore_ascii_case("memory") => ResumeStoreBackend::Memory,
            Ok(other) => {
                return Err(HubError::Config(format!(
                    "HUB_RESUME_STORE must be \"memory\" or \"postgres\", got {other:?}"
                )));
            }
            Err(_) => defaults.resume_store,
        };
        let database_url = env::var("DATABASE_URL").ok();
        if matches!(resume_store, ResumeStoreBackend::Postgres) && database_url.is_none() {
            return Err(HubError::Config(
                "DATABASE_URL is required when HUB_RESUME_STORE=postgres".to_owned(),
            ));
        }

        Ok(Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            resume_store,
            database_url,
            max_buffered_bytes: parse_env_or("HUB_MAX_BUFFERED_BYTES", defaults.max_buffered_bytes)?,
            max_queue_length: parse_env_or("HUB_MAX_QUEUE_LENGTH", defaults.max_queue_length)?,
            outbound_log_limit: parse_env_or("HUB_OUTBOUND_LOG_LIMIT", defaults.outbound_log_limit)?,
            heartbeat_interval_ms: parse_env_or(
                "HUB_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval_ms,
            )?,
            resume_token_ttl_ms: parse_env_or("HUB_RESUME_TOKEN_TTL_MS", defaults.resume_token_ttl_ms)?,
            max_replay_batch_size: parse_env_or(
                "HUB_MAX_REPLAY_BATCH_SIZE",
                defaults.max_replay_batch_size,
            )?,
        })
    }
}

fn parse_env_or<T>(key: &str, default: T) -> Result<T, HubError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| HubError::Config(format!("{key} invalid: {e}"))),
        Err(_) => Ok(default),
    }
}
