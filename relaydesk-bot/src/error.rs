//! Error types for the login core.
//!
//! Two layers:
//! - [`PlatformError`] is what a [`crate::platform::Platform`] implementation
//!   returns. It carries provider-native detail (RPC error names, I/O text).
//! - [`LoginError`] is the closed taxonomy everything above
//!   [`crate::client::ChatClientHandle`] works with. Platform errors are
//!   decoded into it exactly once, at the client boundary.

use std::fmt;
use std::time::Duration;

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error returned by the platform in response to an RPC call.
///
/// Names are SCREAMING_SNAKE_CASE, e.g. `PHONE_CODE_INVALID`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code: i32,
    /// Error name.
    pub name: String,
}

impl RpcError {
    pub fn new(code: i32, name: impl Into<String>) -> Self {
        Self { code, name: name.into() }
    }

    /// Match on the error name, with an optional `'*'` wildcard at either end.
    ///
    /// - `err.is("SESSION_PASSWORD_NEEDED")`: exact match
    /// - `err.is("PHONE_CODE_*")`: starts-with match
    /// - `err.is("*_INVALID")`: ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)
    }
}

// ─── PlatformError ────────────────────────────────────────────────────────────

/// Provider-native failure from a [`crate::platform::Platform`] call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlatformError {
    /// The platform rejected the request.
    #[error("{0}")]
    Rpc(RpcError),
    /// Network / transport failure.
    #[error("I/O error: {0}")]
    Io(String),
    /// An operation that needs a live connection was called before `connect`.
    #[error("not connected")]
    NotConnected,
    /// The platform answered with something we could not interpret.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl PlatformError {
    /// Returns `true` if this is the named RPC error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(e) => e.is(pattern),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for PlatformError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Protocol(e.to_string())
        } else {
            Self::Io(e.to_string())
        }
    }
}

// ─── LoginError ───────────────────────────────────────────────────────────────

/// Every way a login operation can fail, as seen by the web layer.
///
/// Variants split into two groups:
/// - retained-session errors ([`Self::retains_session`]): the caller may retry
///   `verify_code` with the same session id;
/// - everything else: the session (if any) has been discarded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoginError {
    /// Platform credentials are missing for the attempted path.
    #[error("chat platform is not configured: {0}")]
    Configuration(String),
    /// Transport or network failure; the attempt was aborted.
    #[error("could not reach the chat platform: {0}")]
    Connection(String),
    #[error("the verification code is invalid")]
    InvalidCode,
    #[error("the verification code has expired; request a new one")]
    CodeExpired,
    /// The account has two-factor auth enabled and no password was supplied.
    #[error("a two-factor password is required")]
    TwoFactorRequired,
    #[error("the two-factor password is incorrect")]
    InvalidCredentials,
    #[error("login session not found or expired; start the login again")]
    SessionNotFound,
    /// The bridge gave up waiting. The operation may still complete on the loop.
    #[error("timed out after {:?} waiting for the chat platform", .0)]
    Timeout(Duration),
    /// The event loop cannot run the operation for this caller.
    #[error("bot event loop unavailable: {0}")]
    Bridge(String),
    /// Unclassified failure; the session has been discarded.
    #[error("login failed: {0}")]
    Failed(String),
}

impl LoginError {
    /// Whether a `verify_code` failing with this error keeps the session usable.
    pub fn retains_session(&self) -> bool {
        matches!(
            self,
            Self::InvalidCode
                | Self::CodeExpired
                | Self::TwoFactorRequired
                | Self::InvalidCredentials
                | Self::Timeout(_)
        )
    }

    /// HTTP status used by the JSON API for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Configuration(_) => 503,
            Self::Connection(_) | Self::Failed(_) => 502,
            Self::InvalidCode | Self::CodeExpired | Self::InvalidCredentials => 422,
            Self::TwoFactorRequired => 401,
            Self::SessionNotFound => 404,
            Self::Timeout(_) => 504,
            Self::Bridge(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_wildcards() {
        let e = RpcError::new(400, "PHONE_CODE_EXPIRED");
        assert!(e.is("PHONE_CODE_EXPIRED"));
        assert!(e.is("PHONE_CODE_*"));
        assert!(e.is("*_EXPIRED"));
        assert!(!e.is("PHONE_CODE_INVALID"));
        assert!(!PlatformError::NotConnected.is("PHONE_CODE_*"));
    }

    #[test]
    fn retained_errors() {
        assert!(LoginError::InvalidCode.retains_session());
        assert!(LoginError::InvalidCredentials.retains_session());
        assert!(LoginError::Timeout(Duration::from_secs(1)).retains_session());
        assert!(!LoginError::SessionNotFound.retains_session());
        assert!(!LoginError::Connection("reset".into()).retains_session());
        assert!(!LoginError::Failed("boom".into()).retains_session());
    }

    #[test]
    fn messages_are_distinct() {
        let all = [
            LoginError::Configuration("x".into()),
            LoginError::Connection("x".into()),
            LoginError::InvalidCode,
            LoginError::CodeExpired,
            LoginError::TwoFactorRequired,
            LoginError::InvalidCredentials,
            LoginError::SessionNotFound,
            LoginError::Timeout(Duration::from_secs(20)),
            LoginError::Bridge("x".into()),
            LoginError::Failed("x".into()),
        ];
        let mut seen = std::collections::HashSet::new();
        for e in &all {
            assert!(seen.insert(e.to_string()), "duplicate message: {e}");
        }
        assert_eq!(
            LoginError::Timeout(Duration::from_secs(20)).to_string(),
            "timed out after 20s waiting for the chat platform"
        );
        assert_eq!(
            LoginError::Timeout(Duration::from_millis(500)).to_string(),
            "timed out after 500ms waiting for the chat platform"
        );
    }
}
