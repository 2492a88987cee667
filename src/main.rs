use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;

use renewalsync_lib::api::create_router;
use renewalsync_lib::state::{load_config, open_database, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, config_source) = load_config().map_err(anyhow::Error::msg)?;
    renewalsync_lib::init_logging(config.log_format);
    config_source.log();

    let addr: SocketAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", config.bind_address))?;
    if config.enable_seed {
        log::warn!("Seed endpoint enabled; do not run this configuration in production");
    }

    let db = open_database(&config).map_err(anyhow::Error::msg)?;
    let sync_db = db
        .reopen()
        .context("Failed to open the reconciliation connection")?;
    let state = Arc::new(AppState::new(config, db, sync_db));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    log::info!("renewalsync listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    log::info!("renewalsync stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown requested, draining connections");
}
