//! Redacting holder for the proxy's two credentials
//!
//! Wraps the OAuth client secret sent to the token endpoint and the shared
//! bearer secret inbound callers must present. Neither value may reach a
//! log line, a config dump or the health report.

use std::fmt;
use zeroize::Zeroize;

/// A credential that formats as `[REDACTED]` and is zeroed when dropped.
///
/// Config structs derive `Debug` freely; a `Secret` field keeps the value
/// out of that output.
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Raw value, for building the token request form or the expected
    /// `Authorization` header.
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// True for a zero-length value. Whitespace counts as content.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Lets config code wrap values read from env vars or secret files with `.into()`.
impl From<String> for Secret<String> {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
