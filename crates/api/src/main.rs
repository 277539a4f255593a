use std::sync::Arc;

use anyhow::Context;

use stocksync_engine::{EngineConfig, Scheduler};

const BIND_ENV: &str = "STOCKSYNC_BIND";
const DEFAULT_BIND: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stocksync_observability::init();

    let config = EngineConfig::from_env().context("failed to load engine configuration")?;
    let timers = config.timers.clone();

    let services = Arc::new(stocksync_api::app::build_services(config).context("failed to build sync services")?);
    let scheduler = Scheduler::spawn(services.sync.clone(), &timers);
    let app = stocksync_api::app::build_app(services);

    let bind = std::env::var(BIND_ENV).unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    scheduler.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
