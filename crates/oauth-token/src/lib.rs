//! OAuth2 client-credentials token acquisition and caching
//!
//! Fetches access tokens from a single token endpoint and keeps the most
//! recent one in memory until it is within [`EXPIRY_BUFFER`] of expiring.
//! Concurrent callers that find the cache stale share one in-flight fetch.
//!
//! Flow:
//! 1. `TokenManager::new()` with a `reqwest::Client` and `ClientCredentials`
//! 2. Request path calls `TokenSource::access_token()` per inbound request
//! 3. Cache hit returns immediately; a miss POSTs `grant_type=client_credentials`
//!    via `token::request_token()` and replaces the cache on success

pub mod clock;
pub mod error;
pub mod manager;
pub mod token;

#[cfg(test)]
mod test_support;

pub use clock::{Clock, SystemClock};
pub use error::{Error, Result};
pub use manager::{CacheStatus, EXPIRY_BUFFER, TokenManager, TokenSource};
pub use token::{ClientCredentials, TokenResponse, request_token};
