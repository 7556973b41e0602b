//! Postgres pool creation and migration runner (C13) for the durable
//! resume-store backend. Mirrors the teacher's `db.rs` shape exactly — a
//! pool builder and a migration runner, both `.expect()`-checked only at
//! `main`'s call site, never inside library code.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::HubError;

pub async fn create_pool(database_url: &str) -> Result<PgPool, HubError> {
    Ok(PgPoolOptions::new().max_connections(10).connect(database_url).await?)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), HubError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
