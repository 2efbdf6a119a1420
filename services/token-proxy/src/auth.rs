//! Inbound shared-secret check

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use common::Secret;
use std::sync::Arc;

use crate::error::ProxyError;

/// Gate on the inbound `Authorization` header.
///
/// With a configured secret `X`, only requests carrying exactly `Bearer X`
/// pass. Without one, or with an empty one, every request passes. A
/// whitespace-only secret is a real secret and keeps the gate closed.
#[derive(Clone, Debug)]
pub struct AuthGate {
    expected: Option<Arc<Secret<String>>>,
}

impl AuthGate {
    pub fn new(secret: Option<&Secret<String>>) -> Self {
        let expected = secret
            .filter(|s| !s.is_empty())
            .map(|s| Arc::new(Secret::new(format!("Bearer {}", s.expose()))));
        Self { expected }
    }

    pub fn is_enabled(&self) -> bool {
        self.expected.is_some()
    }

    /// Byte-exact comparison: scheme case, extra whitespace, or a second
    /// `Authorization` value all count as a mismatch.
    pub fn check(&self, headers: &HeaderMap) -> Result<(), ProxyError> {
        let Some(expected) = &self.expected else {
            return Ok(());
        };
        let mut values = headers.get_all(AUTHORIZATION).iter();
        match (values.next(), values.next()) {
            (Some(value), None) if value.as_bytes() == expected.expose().as_bytes() => Ok(()),
            _ => Err(ProxyError::AuthRejected),
        }
    }
}
