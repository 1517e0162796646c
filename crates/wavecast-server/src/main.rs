use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tower_governor::GovernorLayer;
use tower_governor::governor::GovernorConfigBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use wavecast_core::OrchestratorConfig;
use wavecast_db::{Database, DatabaseConfig};
use wavecast_server::routes;
use wavecast_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("wavecast=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let admin_token = std::env::var("WAVECAST_ADMIN_TOKEN")
        .ok()
        .filter(|t| !t.is_empty());
    if admin_token.is_none() {
        tracing::warn!("WAVECAST_ADMIN_TOKEN not set, operator endpoints will answer 403");
    }
    let port = std::env::var("WAVECAST_SERVER_PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{port}");

    let config = OrchestratorConfig::from_env()?;
    let db = Database::connect(&DatabaseConfig::from_env()?)
        .await?
        .with_chain_settings(config.chain_settings())
        .with_lease_ttl(config.lease_ttl_delta());
    db.migrate().await?;

    let state = Arc::new(AppState::new(db, admin_token));

    let governor = GovernorConfigBuilder::default()
        .per_second(1)
        .burst_size(30)
        .finish()
        .context("invalid rate limiter configuration")?;

    let app = routes::router(state)
        .layer(GovernorLayer::new(Arc::new(governor)))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("Starting server on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
