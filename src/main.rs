use std::io;
use std::sync::Arc;

use clarify::server;
use clarify::{logging, CacheTable, ChatService, DefaultBackendFactory, ServerConfig};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> io::Result<()> {
    logging::init();

    let config = Arc::new(ServerConfig::from_env().map_err(io::Error::other)?);
    let cache = CacheTable::load(config.cache_path.as_deref()).map_err(io::Error::other)?;
    tracing::info!(
        entries = cache.len(),
        providers = ?config.configured_providers(),
        access_gate = config.access_gate_enabled(),
        "configuration loaded"
    );

    let backends = Arc::new(DefaultBackendFactory::new(Arc::clone(&config)));
    let service = Arc::new(ChatService::new(Arc::clone(&config), cache, backends));

    let listener = TcpListener::bind(config.listen_addr).await?;
    server::serve(listener, service, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
