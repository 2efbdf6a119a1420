//! Response body plumbing
//!
//! A proxied request stays "in flight" until its response body has been fully
//! relayed (or dropped by the client), not merely until headers are sent.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::Stream;
use pin_project_lite::pin_project;
use tracing::warn;

/// Increments a counter on creation and decrements it on drop.
pub struct InFlightGuard {
    counter: Arc<AtomicU64>,
}

impl InFlightGuard {
    pub fn new(counter: Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

pin_project! {
    /// Upstream response body that holds the request's [`InFlightGuard`] and
    /// reports a failure if the upstream connection breaks mid-body.
    pub struct UpstreamBody<S> {
        #[pin]
        inner: S,
        request_id: String,
        errors_total: Arc<AtomicU64>,
        _guard: InFlightGuard,
    }
}

impl<S> UpstreamBody<S> {
    pub fn new(
        inner: S,
        request_id: String,
        errors_total: Arc<AtomicU64>,
        guard: InFlightGuard,
    ) -> Self {
        Self {
            inner,
            request_id,
            errors_total,
            _guard: guard,
        }
    }
}

impl<S> Stream for UpstreamBody<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>>,
{
    type Item = Result<Bytes, reqwest::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let polled = this.inner.poll_next(cx);
        if let Poll::Ready(Some(Err(e))) = &polled {
            this.errors_total.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_upstream_error("stream");
            warn!(
                request_id = %this.request_id,
                error = %crate::error::error_chain(e),
                "upstream body failed mid-stream, aborting response"
            );
        }
        polled
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
