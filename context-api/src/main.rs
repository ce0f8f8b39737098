use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use context_api::core::{config::Settings, service::ContextService};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let settings = Settings::new().context("failed to load configuration")?;
    context_api::init_tracing(&settings.logging);

    info!(
        host = %settings.server.host,
        port = settings.server.port,
        embedding_dimension = settings.corpus.embedding_dimension,
        data_dir = ?settings.storage.data_dir,
        "Starting context API"
    );

    let service = Arc::new(
        ContextService::from_settings(&settings).context("failed to open context corpus")?,
    );
    let app = context_api::create_app(service.clone());

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .context("invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("Server running on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = service.save() {
        error!(error = %e, "Failed to save context corpus on shutdown");
    }
    info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
}
