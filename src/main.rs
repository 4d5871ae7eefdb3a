use std::time::Duration;

use anyhow::Context as _;
use axum_server::tls_rustls::RustlsConfig;
use sidecar_injector::metrics::metrics_app;
use sidecar_injector::{app, build_state_from_env, LogFormat};
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let state = build_state_from_env()?;
    let config = state.config.clone();

    // Initialise structured logging. LOG_LEVEL seeds the filter, a RUST_LOG
    // environment variable overrides it.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));
    match config.log_format {
        LogFormat::Json => fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => fmt().with_env_filter(filter).init(),
    }

    // Liveness, readiness and metrics get their own plaintext listener.
    let metrics_listener = TcpListener::bind(config.metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", config.metrics_addr))?;
    tracing::info!(addr = %config.metrics_addr, "metrics listener up");
    let metrics_router = metrics_app(state.clone());
    tokio::spawn(async move {
        if let Err(err) = axum::serve(metrics_listener, metrics_router).await {
            tracing::error!(error = %err, "metrics listener failed");
        }
    });

    // TLS material is loaded once at startup; rotation means a restart.
    let tls = RustlsConfig::from_pem_file(&config.cert_file, &config.key_file)
        .await
        .with_context(|| {
            format!(
                "failed to load key pair from {} and {}",
                config.cert_file, config.key_file
            )
        })?;

    let handle = axum_server::Handle::new();
    tokio::spawn(shutdown_signal(handle.clone()));

    tracing::info!(addr = %config.webhook_addr, "webhook listening");
    axum_server::bind_rustls(config.webhook_addr, tls)
        .handle(handle)
        .serve(app(state).into_make_service())
        .await
        .context("while running webhook server")?;

    tracing::info!("shutting down cleanly");
    Ok(())
}

async fn shutdown_signal(handle: axum_server::Handle) {
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
