//! HTTP proxy logic
//!
//! Checks the inbound shared secret, swaps the caller's credential for the
//! cached upstream token, and forwards the request to the target API. The
//! upstream response (any status) is relayed as a stream, never buffered.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::body::{Body, HttpBody};
use axum::http::header::{AUTHORIZATION, CONNECTION, CONTENT_LENGTH, HOST};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Uri};
use axum::response::{IntoResponse, Response};
use oauth_token::TokenSource;
use tracing::{debug, info, instrument, warn};

use crate::auth::AuthGate;
use crate::error::{ProxyError, error_chain};
use crate::metrics;
use crate::stream::{InFlightGuard, UpstreamBody};

/// Headers to strip in both directions (hop-by-hop per RFC 7230 Section 6.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    /// Prefix for every outbound URL, used verbatim
    pub target_base_url: String,
    pub auth: AuthGate,
    pub tokens: Arc<dyn TokenSource>,
    /// Bounds connect plus wait for response headers, not the body stream
    pub timeout: Duration,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

/// How a request ended, used as the `outcome` metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Upstream response relayed (whatever its status)
    Responded,
    /// Stopped at the auth gate
    Rejected,
    /// Token or target failure, answered with 502
    Failed,
}

impl Outcome {
    fn label(self) -> &'static str {
        match self {
            Outcome::Responded => "responded",
            Outcome::Rejected => "rejected",
            Outcome::Failed => "failed",
        }
    }
}

/// Proxy one inbound request to the target API.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let guard = InFlightGuard::new(state.in_flight.clone());
    let method = request.method().clone();

    let (response, outcome) = match forward(state, request, &request_id, guard).await {
        Ok(response) => (response, Outcome::Responded),
        Err(ProxyError::AuthRejected) => {
            debug!("rejected inbound request: bad or missing bearer token");
            (ProxyError::AuthRejected.into_response(), Outcome::Rejected)
        }
        Err(err) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            metrics::record_upstream_error(err.kind());
            warn!(error = %err, error_type = err.kind(), "proxy request failed");
            (err.into_response(), Outcome::Failed)
        }
    };

    let status = response.status().as_u16();
    let elapsed = started.elapsed();
    metrics::record_request(status, method.as_str(), outcome.label(), elapsed.as_secs_f64());
    info!(
        status,
        outcome = outcome.label(),
        latency_ms = elapsed.as_millis() as u64,
        "request completed"
    );
    response
}

async fn forward(
    state: &ProxyState,
    request: Request<Body>,
    request_id: &str,
    guard: InFlightGuard,
) -> Result<Response, ProxyError> {
    state.auth.check(request.headers())?;

    let token = state.tokens.access_token().await?;

    let (parts, body) = request.into_parts();
    let url = target_url(&state.target_base_url, &parts.uri);
    let headers = outbound_headers(&parts.headers, &parts.method, &token)?;

    let mut outbound = state
        .client
        .request(parts.method.clone(), &url)
        .headers(headers);
    if forwards_body(&parts.method, &body) {
        outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    debug!(url = %url, "forwarding to target");
    let mut upstream = match tokio::time::timeout(state.timeout, outbound.send()).await {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(e)) => return Err(ProxyError::UpstreamConnect(error_chain(&e))),
        Err(_) => return Err(ProxyError::UpstreamTimeout(state.timeout)),
    };

    let status = upstream.status();
    let upstream_headers = std::mem::take(upstream.headers_mut());
    let body = UpstreamBody::new(
        upstream.bytes_stream(),
        request_id.to_owned(),
        state.errors_total.clone(),
        guard,
    );

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers(&upstream_headers);
    Ok(response)
}

/// Target URL: base followed by the inbound path and query, verbatim.
///
/// No slash normalization: `http://api.example.com/v1` + `/data?x=1`
/// gives `http://api.example.com/v1/data?x=1`.
pub fn target_url(base: &str, uri: &Uri) -> String {
    match uri.path_and_query() {
        Some(pq) => format!("{base}{pq}"),
        None => format!("{base}{}", uri.path()),
    }
}

/// GET never carries a body upstream; other methods stream theirs unless
/// the inbound body is known to be empty.
fn forwards_body(method: &Method, body: &Body) -> bool {
    *method != Method::GET && body.size_hint().exact() != Some(0)
}

/// Inbound headers minus Host, Authorization and hop-by-hop headers, plus
/// `Authorization: Bearer <token>`. Repeated headers keep every value.
fn outbound_headers(
    inbound: &HeaderMap,
    method: &Method,
    token: &str,
) -> Result<HeaderMap, ProxyError> {
    let listed = connection_listed(inbound);
    let mut headers = HeaderMap::with_capacity(inbound.len() + 1);
    for (name, value) in inbound {
        if *name == HOST
            || *name == AUTHORIZATION
            || is_hop_by_hop(name.as_str())
            || listed.contains(name)
            || (*method == Method::GET && *name == CONTENT_LENGTH)
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let mut bearer = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
        oauth_token::Error::InvalidResponse("access_token is not a valid header value".into())
    })?;
    bearer.set_sensitive(true);
    headers.insert(AUTHORIZATION, bearer);
    Ok(headers)
}

/// Upstream response headers minus hop-by-hop headers.
fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let listed = connection_listed(upstream);
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if !is_hop_by_hop(name.as_str()) && !listed.contains(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

/// Extra hop-by-hop headers named in `Connection`.
fn connection_listed(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect()
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
