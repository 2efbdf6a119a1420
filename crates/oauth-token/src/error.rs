//! Error types for token endpoint interactions

use std::time::Duration;

/// Errors from fetching a client-credentials token.
///
/// `Clone` so a single failed fetch can be handed to every caller that
/// was waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("token request failed: {0}")]
    Http(String),

    #[error("token request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("token endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid token response: {0}")]
    InvalidResponse(String),
}

/// Result alias for token operations.
pub type Result<T> = std::result::Result<T, Error>;
