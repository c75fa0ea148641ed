// Error handling module
// Defines the credential lifecycle error taxonomy

use thiserror::Error;

/// Errors produced by the credential core.
///
/// Every failure path resolves to one of these kinds. The type is `Clone`
/// because a single refresh outcome is fanned out to every waiter attached
/// to the in-flight ticket.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Nothing usable is stored
    #[error("No credential available")]
    NoCredential,

    /// Stored or received token could not be decoded
    #[error("Malformed token: {0}")]
    DecodeError(String),

    /// Access credential expired and could not be renewed
    #[error("Credential expired")]
    Expired,

    /// Server explicitly rejected the refresh credential
    #[error("Refresh rejected by server: {status}")]
    RefreshRejected { status: u16 },

    /// Exchange could not complete (connect error, timeout, unreadable body)
    #[error("Network failure: {0}")]
    NetworkFailure(String),

    /// Request still unauthorized after the single refresh-and-retry
    #[error("Request still unauthorized after retry: {status}")]
    RetryExhausted { status: u16 },

    /// Non-auth error status from a typed call
    #[error("Storefront API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Credential store failure
    #[error("Credential storage error: {0}")]
    Storage(String),

    /// Request could not be prepared for sending
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl AuthError {
    /// Unrecoverable errors end the current session: credentials are cleared
    /// and Session State flips to unauthenticated.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            AuthError::NoCredential | AuthError::DecodeError(_) | AuthError::RefreshRejected { .. }
        )
    }

    /// Categorize a transport error the way the dispatcher logs it
    pub(crate) fn from_transport(e: &reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            "timeout"
        } else if e.is_connect() {
            "connection_failed"
        } else if e.is_request() {
            "request_error"
        } else if e.is_body() {
            "body_error"
        } else if e.is_decode() {
            "decode_error"
        } else {
            "unknown"
        };
        AuthError::NetworkFailure(format!("{} ({})", e, kind))
    }
}

impl From<rusqlite::Error> for AuthError {
    fn from(e: rusqlite::Error) -> Self {
        AuthError::Storage(e.to_string())
    }
}

/// Result type alias for credential operations
pub type Result<T> = std::result::Result<T, AuthError>;
