mod config;
mod error;
mod gateway;
mod media;
mod models;
mod normalizer;
mod notify;
mod placeholder;
mod preprocess;
mod prompt;
mod provider;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AppConfig;
use crate::gateway::GenerationGateway;
use crate::notify::channel_from_config;
use crate::preprocess::Preprocessor;
use crate::routes::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();

    // Init tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.server.json_logs {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().with_env_filter(filter).init();
    }

    let client = reqwest::Client::builder()
        .timeout(config.provider.request_timeout)
        .build()
        .context("building HTTP client")?;

    let preprocessor = Preprocessor::new(client.clone(), &config.preprocess);
    let gateway = GenerationGateway::from_config(client.clone(), &config.provider, preprocessor);
    if gateway.is_configured() {
        tracing::info!(
            endpoints = config.provider.endpoints.len(),
            mode = ?config.provider.mode,
            "Image provider configured"
        );
    } else {
        tracing::warn!("IMAGE_API_KEY not set; /generate will answer 500");
    }

    let notifier = channel_from_config(&client, &config.messaging);
    match &notifier {
        Some(channel) => tracing::info!("Orders will be forwarded via {}", channel.name()),
        None => tracing::warn!("No messaging channel configured; /send-order will answer 500"),
    }

    let state = AppState { gateway: Arc::new(gateway), notifier };
    let app = router(state, &config.server);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "Starting server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
