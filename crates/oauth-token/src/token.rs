//! Client-credentials token request
//!
//! One POST to the configured token endpoint with a form-encoded body:
//! `grant_type=client_credentials&client_id=<id>&client_secret=<secret>`.
//! Any non-2xx status is reported with the endpoint's body for diagnostics.

use std::time::Duration;

use common::Secret;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Successful token endpoint response.
///
/// `expires_in` is a delta in seconds from the response time. The caller
/// converts it to an absolute unix millisecond timestamp when caching.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Credentials and endpoint for the client-credentials grant.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: Secret<String>,
}

/// Request a new access token.
///
/// `timeout` bounds the whole exchange, including reading the response body.
pub async fn request_token(
    client: &reqwest::Client,
    credentials: &ClientCredentials,
    timeout: Duration,
) -> Result<TokenResponse> {
    let response = client
        .post(&credentials.token_url)
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.expose().as_str()),
        ])
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| transport_error(e, timeout))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| transport_error(e, timeout))?;
    parse_token_response(&body)
}

fn parse_token_response(body: &[u8]) -> Result<TokenResponse> {
    let token: TokenResponse =
        serde_json::from_slice(body).map_err(|e| Error::InvalidResponse(e.to_string()))?;
    if token.access_token.is_empty() {
        return Err(Error::InvalidResponse("empty access_token".into()));
    }
    Ok(token)
}

/// Timeouts keep their own variant; anything else carries the full cause chain.
fn transport_error(e: reqwest::Error, timeout: Duration) -> Error {
    if e.is_timeout() {
        return Error::Timeout(timeout);
    }
    let mut message = e.to_string();
    let mut source = std::error::Error::source(&e);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    Error::Http(message)
}
