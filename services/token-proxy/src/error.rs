//! Per-request failure taxonomy
//!
//! Every variant is terminal for the request that produced it and maps to
//! exactly one HTTP response. Nothing here is retried.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Reasons a proxied exchange ends without relaying an upstream response.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Inbound shared secret missing or wrong
    #[error("Unauthorized: Invalid or missing Bearer token")]
    AuthRejected,

    /// Token endpoint unreachable, non-2xx, or malformed body
    #[error("Failed to authenticate with upstream API: {0}")]
    UpstreamAuth(#[from] oauth_token::Error),

    /// Target API unreachable or protocol error
    #[error("{0}")]
    UpstreamConnect(String),

    /// Target API sent no response headers within the upstream timeout
    #[error("upstream timeout after {0:?}")]
    UpstreamTimeout(std::time::Duration),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::AuthRejected => StatusCode::UNAUTHORIZED,
            ProxyError::UpstreamAuth(_)
            | ProxyError::UpstreamConnect(_)
            | ProxyError::UpstreamTimeout(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Metrics label for `proxy_upstream_errors_total`.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::AuthRejected => "auth_rejected",
            ProxyError::UpstreamAuth(_) => "token",
            ProxyError::UpstreamConnect(_) => "connect",
            ProxyError::UpstreamTimeout(_) => "timeout",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = match &self {
            ProxyError::AuthRejected => serde_json::json!({ "error": self.to_string() }),
            _ => serde_json::json!({
                "error": "Bad Gateway",
                "details": self.to_string(),
            }),
        };
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

/// Render an error with its full `source()` chain.
///
/// reqwest's top-level message ("error sending request for url ...") hides
/// the cause; the chain carries the DNS/connect/TLS detail.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_msg = cause.to_string();
        if !message.contains(&cause_msg) {
            message.push_str(": ");
            message.push_str(&cause_msg);
        }
        source = cause.source();
    }
    message
}
