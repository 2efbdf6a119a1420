//! Token Proxy
//!
//! Single-binary authenticating reverse proxy that:
//! 1. Checks callers against a shared bearer secret
//! 2. Obtains and caches an OAuth2 client-credentials token
//! 3. Forwards every request to the target API with that token
//! 4. Streams the target's response back unchanged

mod admin;
mod auth;
mod config;
mod error;
mod metrics;
mod proxy;
mod stream;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::Response;
use oauth_token::{ClientCredentials, TokenManager, TokenSource};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::AdminState;
use crate::auth::AuthGate;
use crate::config::Config;
use crate::metrics::ServiceMetrics;
use crate::proxy::ProxyState;

/// How long in-flight requests may keep draining after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the proxy router: every path and method goes to the catch-all.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: ProxyState, max_connections: usize) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before the filter reads LOG_LEVEL
    let dotenv = dotenvy::dotenv();

    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting token-proxy");
    match dotenv {
        Ok(path) => debug!(path = %path.display(), "loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => warn!(error = %e, "failed to load .env, continuing with process environment"),
    }

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    match &config_path {
        Some(path) => info!(path = %path.display(), "loading configuration"),
        None => info!("no config file, using environment only"),
    }

    let config = Config::load(config_path.as_deref()).with_context(|| match &config_path {
        Some(path) => format!("failed to load config from {}", path.display()),
        None => "failed to load config from environment".to_string(),
    })?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        target_api_base_url = %config.proxy.target_api_base_url,
        token_url = %config.oauth.token_url,
        inbound_auth = config.proxy.incoming_bearer_token.is_some(),
        "configuration loaded"
    );
    if config.proxy.incoming_bearer_token.is_none() {
        warn!("INCOMING_BEARER_TOKEN not set, inbound requests are not authenticated");
    }

    let upstream_timeout = Duration::from_secs(config.proxy.timeout_secs);
    let client = reqwest::Client::builder()
        .connect_timeout(upstream_timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("failed to build HTTP client")?;

    let tokens: Arc<dyn TokenSource> = Arc::new(TokenManager::new(
        client.clone(),
        ClientCredentials {
            token_url: config.oauth.token_url.clone(),
            client_id: config.oauth.client_id.clone(),
            client_secret: config.oauth.client_secret.clone(),
        },
        Duration::from_secs(config.oauth.timeout_secs),
    ));

    let auth = AuthGate::new(config.proxy.incoming_bearer_token.as_ref());
    let metrics = ServiceMetrics::new();

    let proxy_state = ProxyState {
        client,
        target_base_url: config.proxy.target_api_base_url.clone(),
        auth: auth.clone(),
        tokens: tokens.clone(),
        timeout: upstream_timeout,
        requests_total: metrics.requests_total.clone(),
        errors_total: metrics.errors_total.clone(),
        in_flight: metrics.in_flight.clone(),
    };

    let app = build_router(proxy_state, config.proxy.max_connections);

    let listener = TcpListener::bind(config.proxy.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.proxy.listen_addr))?;

    // Both listeners drain on the same signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_handle = match config.admin_addr {
        Some(admin_addr) => {
            let admin_listener = TcpListener::bind(admin_addr)
                .await
                .with_context(|| format!("failed to bind admin listener to {admin_addr}"))?;
            let admin_app = admin::build_admin_router(AdminState {
                tokens,
                metrics: metrics.clone(),
                prometheus: prometheus_handle,
                auth_enabled: auth.is_enabled(),
            });
            let mut rx = shutdown_rx.clone();
            info!(addr = %admin_addr, "admin listener ready");
            Some(tokio::spawn(async move {
                axum::serve(admin_listener, admin_app)
                    .with_graceful_shutdown(async move {
                        let _ = rx.changed().await;
                    })
                    .await
            }))
        }
        None => None,
    };

    info!(addr = %config.proxy.listen_addr, "accepting requests");

    // Clone in_flight counter for drain observability after shutdown
    let in_flight = metrics.in_flight.clone();

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts: signal the server to drain, then race it against the timer.
    let mut rx = shutdown_rx;
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.changed().await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    if let Some(handle) = admin_handle {
        handle.abort();
    }

    info!("shutdown complete");
    Ok(())
}

/// Catch-all handler that proxies every request to the target API.
async fn proxy_handler(
    State(state): State<ProxyState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
