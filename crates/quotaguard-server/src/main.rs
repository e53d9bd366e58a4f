//! QuotaGuard Service Binary
//!
//! Usage metering and quota enforcement over HTTP/JSON.

mod config;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use prometheus::Registry;
use quotaguard_common::VERSION;
use quotaguard_meter::QuotaGuard;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ServerConfig;
use crate::routes::{router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting QuotaGuard v{}", VERSION);

    let config = ServerConfig::load()?;
    info!(
        "Loaded configuration: bind={}, redis={}, policy={:?}",
        config.bind_addr(),
        config.meter.redis_url.is_some(),
        config.meter.policy_path
    );

    let resolver = config.resolver()?;
    let guard = QuotaGuard::from_config(&config.meter, Arc::new(resolver)).await?;

    let registry = Registry::new();
    guard.meter().metrics().register(&registry)?;

    let state = AppState {
        meter: guard.meter().clone(),
        registry: Arc::new(registry),
        backend: guard.backend().as_str(),
    };
    let app = router(state);

    let addr: SocketAddr = config.bind_addr().parse()?;
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("QuotaGuard listening on {}", addr);
    info!("Endpoints: /health, /metrics, /v1/tenants/:tenant/usage[/:feature[/consume]], /v1/tenants/:tenant/history");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down QuotaGuard");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}
