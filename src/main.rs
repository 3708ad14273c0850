// src/main.rs

use board_chat::{
    api,
    auth::JwtResolver,
    config::Config,
    database::{MemoryMessageStore, MessageStore, PgMessageStore, setup_database},
    hub::{Hub, HubHandle},
    state::AppState,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// The main entry point for our application.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let store: Arc<dyn MessageStore> = match config.database_url.as_deref() {
        Some(url) => Arc::new(PgMessageStore::new(setup_database(url).await?)),
        None => {
            warn!("DATABASE_URL not set, keeping messages in memory");
            Arc::new(MemoryMessageStore::new())
        }
    };

    let (hub, hub_task) = Hub::spawn();
    let identity = Arc::new(JwtResolver::new(&config.jwt_secret));
    let address = config.bind_address();
    let state = AppState::new(hub.clone(), store, identity, config);
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!(address = %address, "Chat server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await?;

    hub_task.await?;
    info!("Server stopped");
    Ok(())
}

/// Waits for Ctrl-C, then tells the hub to close every connection.
async fn shutdown_signal(hub: HubHandle) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
    hub.shutdown();
}
