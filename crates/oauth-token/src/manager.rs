//! Cached access token with single-flight refresh
//!
//! The cache holds at most one token and its absolute expiry. A token is
//! served from cache while `expires_at > now + EXPIRY_BUFFER`. Past that
//! point the first caller spawns a fetch task and parks a shared handle to
//! it in the `in_flight` slot; every caller arriving before it finishes
//! awaits the same handle, so one expiry event costs exactly one token
//! request. The task itself stores the token and clears the slot, so it
//! completes even when every caller has gone away.
//!
//! Lock order is always `in_flight` then `cache`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::token::{ClientCredentials, request_token};

/// Safety margin before expiry during which a cached token is no longer used.
pub const EXPIRY_BUFFER: Duration = Duration::from_secs(10);

type SharedFetch = Shared<BoxFuture<'static, Result<String>>>;

/// Abstraction over where the proxy gets its upstream bearer token.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn TokenSource>`).
pub trait TokenSource: Send + Sync {
    /// A token that is valid for at least `EXPIRY_BUFFER`, fetching one if needed.
    fn access_token(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>>;

    /// Cache state for the health endpoint. Never includes the token itself.
    fn status(&self) -> Pin<Box<dyn Future<Output = CacheStatus> + Send + '_>>;
}

/// Point-in-time view of the cache.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    /// A token has been fetched at least once
    pub cached: bool,
    /// The cached token would be served without a fetch right now
    pub usable: bool,
    /// Absolute expiry in unix milliseconds, 0 if never fetched
    pub expires_at_millis: u64,
    /// Seconds left before the token expires (0 once expired)
    pub expires_in_secs: u64,
    /// A fetch is currently in progress
    pub refreshing: bool,
}

#[derive(Default)]
struct TokenCache {
    access_token: Option<String>,
    expires_at: u64,
}

impl TokenCache {
    fn usable(&self, now_millis: u64) -> Option<&str> {
        let threshold = now_millis.saturating_add(EXPIRY_BUFFER.as_millis() as u64);
        match &self.access_token {
            Some(token) if self.expires_at > threshold => Some(token),
            _ => None,
        }
    }
}

struct InFlight {
    /// Distinguishes this fetch from any later one sharing the slot
    generation: u64,
    fetch: SharedFetch,
}

#[derive(Default)]
struct InFlightSlot {
    current: Option<InFlight>,
    next_generation: u64,
}

/// Owns the cached upstream token for one set of client credentials.
pub struct TokenManager<C: Clock = SystemClock> {
    client: reqwest::Client,
    credentials: Arc<ClientCredentials>,
    timeout: Duration,
    clock: C,
    cache: Arc<RwLock<TokenCache>>,
    in_flight: Arc<Mutex<InFlightSlot>>,
}

impl TokenManager<SystemClock> {
    pub fn new(client: reqwest::Client, credentials: ClientCredentials, timeout: Duration) -> Self {
        Self::with_clock(client, credentials, timeout, SystemClock)
    }
}

impl<C: Clock> TokenManager<C> {
    pub fn with_clock(
        client: reqwest::Client,
        credentials: ClientCredentials,
        timeout: Duration,
        clock: C,
    ) -> Self {
        Self {
            client,
            credentials: Arc::new(credentials),
            timeout,
            clock,
            cache: Arc::new(RwLock::new(TokenCache::default())),
            in_flight: Arc::new(Mutex::new(InFlightSlot::default())),
        }
    }

    async fn cached(&self) -> Option<String> {
        let now = self.clock.now_millis();
        self.cache.read().await.usable(now).map(str::to_owned)
    }

    async fn acquire(&self) -> Result<String> {
        if let Some(token) = self.cached().await {
            return Ok(token);
        }

        let fetch = {
            let mut slot = self.in_flight.lock().await;
            // Another fetch may have finished while we waited for the slot.
            if let Some(token) = self.cached().await {
                return Ok(token);
            }
            match slot.current.as_ref() {
                Some(in_flight) => {
                    debug!("joining in-flight token fetch");
                    in_flight.fetch.clone()
                }
                None => {
                    let generation = slot.next_generation;
                    slot.next_generation += 1;
                    let fetch = self.start_fetch(generation);
                    slot.current = Some(InFlight {
                        generation,
                        fetch: fetch.clone(),
                    });
                    fetch
                }
            }
        };

        fetch.await
    }

    /// Spawn the token request as its own task.
    ///
    /// The task stores a successful token and empties the slot before it
    /// returns, so waiters only ever see a settled cache. A failed fetch
    /// leaves the previous cache contents in place.
    fn start_fetch(&self, generation: u64) -> SharedFetch {
        let client = self.client.clone();
        let credentials = Arc::clone(&self.credentials);
        let timeout = self.timeout;
        let cache = Arc::clone(&self.cache);
        let in_flight = Arc::clone(&self.in_flight);
        let requested_at = self.clock.now_millis();

        let task = tokio::spawn(async move {
            info!(token_url = %credentials.token_url, "fetching new access token");
            let result = request_token(&client, &credentials, timeout).await;

            let mut slot = in_flight.lock().await;
            if slot
                .current
                .as_ref()
                .is_some_and(|current| current.generation == generation)
            {
                slot.current = None;
            }

            match result {
                Ok(token) => {
                    metrics::counter!("token_fetches_total", "result" => "success").increment(1);
                    let expires_at =
                        requested_at.saturating_add(token.expires_in.saturating_mul(1000));
                    *cache.write().await = TokenCache {
                        access_token: Some(token.access_token.clone()),
                        expires_at,
                    };
                    info!(expires_in = token.expires_in, "token refreshed successfully");
                    Ok(token.access_token)
                }
                Err(e) => {
                    metrics::counter!("token_fetches_total", "result" => "failure").increment(1);
                    warn!(error = %e, "error fetching access token");
                    Err(e)
                }
            }
        });

        async move {
            task.await
                .unwrap_or_else(|e| Err(Error::Http(format!("token fetch task failed: {e}"))))
        }
        .boxed()
        .shared()
    }

    async fn snapshot(&self) -> CacheStatus {
        let refreshing = self.in_flight.lock().await.current.is_some();
        let now = self.clock.now_millis();
        let cache = self.cache.read().await;
        CacheStatus {
            cached: cache.access_token.is_some(),
            usable: cache.usable(now).is_some(),
            expires_at_millis: cache.expires_at,
            expires_in_secs: cache.expires_at.saturating_sub(now) / 1000,
            refreshing,
        }
    }
}

impl<C: Clock> TokenSource for TokenManager<C> {
    fn access_token(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        Box::pin(self.acquire())
    }

    fn status(&self) -> Pin<Box<dyn Future<Output = CacheStatus> + Send + '_>> {
        Box::pin(self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::Error;
    use crate::test_support::{MockTokenEndpoint, credentials};

    const START: u64 = 1_700_000_000_000;

    fn manager(endpoint: &MockTokenEndpoint, clock: &ManualClock) -> TokenManager<ManualClock> {
        TokenManager::with_clock(
            reqwest::Client::new(),
            credentials(&endpoint.url),
            Duration::from_secs(5),
            clock.clone(),
        )
    }

    #[tokio::test]
    async fn second_call_within_window_reuses_cached_token() {
        let endpoint = MockTokenEndpoint::start(Duration::ZERO).await;
        let clock = ManualClock::new(START);
        let tokens = manager(&endpoint, &clock);

        let first = tokens.access_token().await.unwrap();
        clock.advance(Duration::from_secs(60));
        let second = tokens.access_token().await.unwrap();

        assert_eq!(first, "T1");
        assert_eq!(second, "T1");
        assert_eq!(endpoint.hits(), 1, "cached token must not trigger a fetch");
    }

    #[tokio::test]
    async fn token_is_refetched_once_inside_expiry_buffer() {
        let endpoint = MockTokenEndpoint::start(Duration::ZERO).await;
        let clock = ManualClock::new(START);
        let tokens = manager(&endpoint, &clock);

        assert_eq!(tokens.access_token().await.unwrap(), "T1");

        // expires_at = START + 3600s; 10_001ms before it the token is still usable
        clock.set(START + 3_600_000 - 10_001);
        assert_eq!(tokens.access_token().await.unwrap(), "T1");
        assert_eq!(endpoint.hits(), 1);

        // exactly at expires_at - 10s it is not
        clock.set(START + 3_600_000 - 10_000);
        assert_eq!(tokens.access_token().await.unwrap(), "T2");
        assert_eq!(tokens.access_token().await.unwrap(), "T2");
        assert_eq!(endpoint.hits(), 2, "one refresh per expiry");

        let status = tokens.status().await;
        assert!(status.usable);
        assert_eq!(status.expires_at_millis, START + 3_600_000 - 10_000 + 3_600_000);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let endpoint = MockTokenEndpoint::start(Duration::from_millis(50)).await;
        let clock = ManualClock::new(START);
        let tokens = Arc::new(manager(&endpoint, &clock));

        let calls = (0..16).map(|_| {
            let tokens = tokens.clone();
            async move { tokens.access_token().await }
        });
        let results = futures_util::future::join_all(calls).await;

        for result in results {
            assert_eq!(result.unwrap(), "T1");
        }
        assert_eq!(endpoint.hits(), 1, "concurrent misses must collapse into one fetch");
    }

    #[tokio::test]
    async fn concurrent_callers_across_tasks_share_one_fetch() {
        let endpoint = MockTokenEndpoint::start(Duration::from_millis(50)).await;
        let clock = ManualClock::new(START);
        let tokens = Arc::new(manager(&endpoint, &clock));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tokens = tokens.clone();
                tokio::spawn(async move { tokens.access_token().await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "T1");
        }
        assert_eq!(endpoint.hits(), 1);
    }

    #[tokio::test]
    async fn failed_fetch_is_shared_and_leaves_cache_untouched() {
        let endpoint = MockTokenEndpoint::start(Duration::from_millis(20)).await;
        let clock = ManualClock::new(START);
        let tokens = Arc::new(manager(&endpoint, &clock));

        assert_eq!(tokens.access_token().await.unwrap(), "T1");
        let before = tokens.status().await;

        clock.advance(Duration::from_secs(3_595));
        endpoint.set_failing(true);

        let calls = (0..4).map(|_| {
            let tokens = tokens.clone();
            async move { tokens.access_token().await }
        });
        for result in futures_util::future::join_all(calls).await {
            match result {
                Err(Error::Rejected { status, body }) => {
                    assert_eq!(status, 400);
                    assert!(body.contains("invalid_grant"));
                }
                other => panic!("expected Rejected, got {other:?}"),
            }
        }
        assert_eq!(endpoint.hits(), 2, "waiters must share the failed fetch");

        let after = tokens.status().await;
        assert!(after.cached);
        assert!(!after.usable);
        assert!(!after.refreshing);
        assert_eq!(after.expires_at_millis, before.expires_at_millis);

        // Recovery: the next call after the failure fetches again.
        endpoint.set_failing(false);
        assert_eq!(tokens.access_token().await.unwrap(), "T3");
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_without_caching() {
        let clock = ManualClock::new(START);
        let tokens = TokenManager::with_clock(
            reqwest::Client::new(),
            credentials("http://127.0.0.1:1/oauth/token"),
            Duration::from_secs(5),
            clock,
        );

        let err = tokens.access_token().await.unwrap_err();
        assert!(matches!(err, Error::Http(_)), "got: {err:?}");

        let status = tokens.status().await;
        assert!(!status.cached);
        assert_eq!(status.expires_at_millis, 0);
    }

    #[tokio::test]
    async fn cancelled_starter_does_not_strand_the_fetch() {
        let endpoint = MockTokenEndpoint::start(Duration::from_millis(50)).await;
        let clock = ManualClock::new(START);
        let tokens = Arc::new(manager(&endpoint, &clock));

        // Start a fetch and abandon it before the endpoint answers.
        let starter = {
            let tokens = tokens.clone();
            tokio::spawn(async move { tokens.access_token().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        starter.abort();

        assert_eq!(tokens.access_token().await.unwrap(), "T1");
        assert_eq!(endpoint.hits(), 1);
    }

    #[tokio::test]
    async fn abandoned_fetch_completes_and_fills_cache() {
        let endpoint = MockTokenEndpoint::start(Duration::from_millis(50)).await;
        let clock = ManualClock::new(START);
        let tokens = Arc::new(TokenManager::with_clock(
            reqwest::Client::new(),
            credentials(&endpoint.url),
            Duration::from_millis(200),
            clock.clone(),
        ));

        let starter = {
            let tokens = tokens.clone();
            tokio::spawn(async move { tokens.access_token().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        starter.abort();

        // Wait well past both the endpoint delay and the fetch timeout with
        // nobody polling the abandoned request.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let status = tokens.status().await;
        assert!(status.usable, "abandoned fetch must still store its token");
        assert!(!status.refreshing, "finished fetch must leave the slot empty");

        assert_eq!(tokens.access_token().await.unwrap(), "T1");
        assert_eq!(endpoint.hits(), 1, "cached token from the abandoned fetch is reused");
    }

    #[test]
    fn cache_usable_boundary() {
        let cache = TokenCache {
            access_token: Some("T".into()),
            expires_at: 20_000,
        };
        assert_eq!(cache.usable(9_999), Some("T"));
        assert_eq!(cache.usable(10_000), None);
        assert_eq!(TokenCache::default().usable(0), None);
    }
}
