use thiserror::Error;

/// Errors surfaced by the handful of hub operations that return a `Result`
/// rather than a close code — resume-store I/O, startup, and config
/// parsing. Per-frame protocol failures are never wrapped in this type;
/// they are expressed as WebSocket close codes (see `frame_handler`).
#[derive(Debug, Error)]
pub enum HubError {
    #[error("resume store error: {0}")]
    ResumeStore(#[from] sqlx::Error),

    #[error("failed to (de)serialize resume state: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("configuration error: {0}")]
    Config(String),
}
