//! Admin listener
//!
//! Runs on a separate port so the main listener can forward every path,
//! including `/health` and `/metrics`, to the target API.
//!
//! Endpoints:
//! - GET /health  - liveness, counters, token cache state (never the token)
//! - GET /metrics - Prometheus text exposition

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use oauth_token::TokenSource;

use crate::metrics::ServiceMetrics;

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub tokens: Arc<dyn TokenSource>,
    pub metrics: ServiceMetrics,
    pub prometheus: PrometheusHandle,
    pub auth_enabled: bool,
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// GET /health - always 200 while the process is serving.
///
/// An unusable token cache is reported, not treated as unhealthy: the next
/// proxied request fetches a fresh token.
async fn health_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let token = state.tokens.status().await;
    let body = serde_json::json!({
        "status": "healthy",
        "uptime_seconds": state.metrics.started_at.elapsed().as_secs(),
        "requests_served": state.metrics.requests_total.load(Ordering::Relaxed),
        "errors_total": state.metrics.errors_total.load(Ordering::Relaxed),
        "in_flight": state.metrics.in_flight.load(Ordering::Relaxed),
        "inbound_auth": if state.auth_enabled { "enabled" } else { "disabled" },
        "token": token,
    });

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// GET /metrics - Prometheus text exposition format.
async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}
