//! OAuth error types.

use thiserror::Error;

/// Errors raised by the token store and the device flow.
#[derive(Debug, Error)]
pub enum OAuthError {
    /// Reading or writing the token directory failed.
    #[error("token store I/O error at {path}: {reason}")]
    Io {
        path: String,
        reason: String,
    },

    /// The provider endpoint could not be reached or answered badly.
    #[error("OAuth request to {endpoint} failed: {reason}")]
    Http {
        endpoint: String,
        reason: String,
    },

    /// A provider response or stored token could not be parsed.
    #[error("failed to parse {what}: {reason}")]
    Decode {
        what: String,
        reason: String,
    },

    /// Required provider settings are missing.
    #[error("OAuth not configured: {reason}")]
    NotConfigured {
        reason: String,
    },

    /// The device code expired before the user authorized.
    #[error("device code expired, please try again")]
    ExpiredToken,

    /// The user declined the authorization request.
    #[error("user denied authorization")]
    AccessDenied,

    /// Any other error reported by the provider.
    #[error("token error: {error} - {description}")]
    Provider {
        error: String,
        description: String,
    },

    /// The device code's lifetime elapsed while polling.
    #[error("gave up polling after {elapsed_secs}s")]
    PollTimeout {
        elapsed_secs: u64,
    },
}
