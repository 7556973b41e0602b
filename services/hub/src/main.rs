use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use hub::auth::{AuthClaims, Authenticator, StaticTokenAuthenticator};
use hub::config::{HubConfig, ResumeStoreBackend};
use hub::queue::{run_consumer_loop, MpscChannelQueue};
use hub::resume_store::{InMemoryResumeStore, PostgresResumeStore, ResumeStore};
use hub::{db, metrics as hub_metrics, Hub};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = HubConfig::from_env().expect("invalid hub configuration");

    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(config.log_level.clone())).init();
    hub_metrics::describe_metrics();

    let resume_store: Arc<dyn ResumeStore> = match config.resume_store {
        ResumeStoreBackend::Memory => InMemoryResumeStore::new(),
        ResumeStoreBackend::Postgres => {
            let database_url = config.database_url.clone().expect("DATABASE_URL required for postgres resume store");
            info!("connecting to database...");
            let pool = db::create_pool(&database_url).await.expect("failed to connect to Postgres");
            db::run_migrations(&pool).await.expect("failed to run database migrations");
            info!("migrations applied");
            PostgresResumeStore::new(pool)
        }
    };

    let authenticator: Arc<dyn Authenticator> = Arc::new(StaticTokenAuthenticator::new(static_tokens_from_env()));

    let bind_addr = config.bind_addr.clone();
    let hub = Hub::new(config, resume_store, authenticator, None, None);

    // Keeps the reference in-process queue's receiver open for the life of
    // the process; a real deployment wires `QueueConsumer`/the transport
    // adapter to an actual broker instead of this channel.
    let (tx, rx) = mpsc::channel(1024);
    tokio::spawn(async move {
        let _keepalive = tx;
        std::future::pending::<()>().await;
    });
    let consumer_hub = Arc::clone(&hub);
    tokio::spawn(run_consumer_loop(consumer_hub, Arc::new(MpscChannelQueue), rx, |msg, err| {
        tracing::error!(id = ?msg.id, error = %err, "failed to broadcast queued message");
    }));

    let router = hub::build_router(Arc::clone(&hub));
    let listener = tokio::net::TcpListener::bind(&bind_addr).await.expect("failed to bind");
    info!(addr = %bind_addr, "hub listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
    info!("hub shut down gracefully");
}

/// Parses `HUB_STATIC_TOKENS` as `token:account_id:device_id` pairs
/// separated by commas. Unset means no bearer tokens authenticate — the
/// embedding application is expected to supply its own `Authenticator`
/// rather than run the hub standalone in production.
fn static_tokens_from_env() -> HashMap<String, AuthClaims> {
    let mut tokens = HashMap::new();
    let Ok(raw) = env::var("HUB_STATIC_TOKENS") else { return tokens };
    for entry in raw.split(',').filter(|s| !s.is_empty()) {
        let mut parts = entry.splitn(3, ':');
        if let (Some(token), Some(account_id), Some(device_id)) = (parts.next(), parts.next(), parts.next()) {
            tokens.insert(token.to_owned(), AuthClaims { account_id: account_id.to_owned(), device_id: device_id.to_owned() });
        }
    }
    tokens
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
