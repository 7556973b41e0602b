pub mod auth;
pub mod codec;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod frame_handler;
pub mod hub;
pub mod lifecycle;
pub mod metrics;
pub mod queue;
pub mod rate_limit;
pub mod resume;
pub mod resume_store;
pub mod socket;
pub mod ws;

pub use config::HubConfig;
pub use error::HubError;
pub use hub::Hub;

use std::sync::Arc;

use axum::Router;

/// Assembles the hub's `axum::Router`: today this is a single websocket
/// route, but kept as its own function (rather than inlined in `main`) so
/// integration tests can mount it on an ephemeral port exactly the way
/// production does.
pub fn build_router(hub: Arc<Hub>) -> Router {
    ws::router(hub)
}
