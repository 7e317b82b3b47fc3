//! OAuth token and provider types.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Tokens this close to expiry are treated as already gone.
pub const EXPIRY_BUFFER_SECS: i64 = 5 * 60;

// ─── Token ───────────────────────────────────────────────────────────────────

/// A persisted OAuth access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthToken {
    pub fn bearer(access_token: &str) -> Self {
        Self {
            access_token: access_token.to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: None,
            scope: None,
            expires_at: None,
        }
    }

    /// Expired, or within the safety buffer of expiring, at `now`.
    ///
    /// A token without an expiry never expires.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now + ChronoDuration::seconds(EXPIRY_BUFFER_SECS) > expires_at,
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Value for the `Authorization` header, e.g. `Bearer abc123`.
    pub fn authorization_header(&self) -> String {
        let token_type = if self.token_type.is_empty() {
            "Bearer"
        } else {
            self.token_type.as_str()
        };
        format!("{token_type} {}", self.access_token)
    }
}

/// Human-facing summary of a backend's authentication state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenStatus {
    pub authenticated: bool,
    /// One of `not_authenticated`, `valid`, `expired`.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_secs: Option<i64>,
}

impl TokenStatus {
    pub(crate) fn not_authenticated() -> Self {
        Self {
            authenticated: false,
            status: "not_authenticated".into(),
            token_type: None,
            scope: None,
            expires_at: None,
            expires_in_secs: None,
        }
    }

    pub(crate) fn for_token(token: &OAuthToken, now: DateTime<Utc>) -> Self {
        let expired = token.is_expired_at(now);
        Self {
            authenticated: !expired,
            status: if expired { "expired" } else { "valid" }.into(),
            token_type: Some(token.token_type.clone()),
            scope: token.scope.clone(),
            expires_at: token.expires_at,
            expires_in_secs: token
                .expires_at
                .filter(|_| !expired)
                .map(|at| (at - now).num_seconds()),
        }
    }
}

// ─── Provider Config ─────────────────────────────────────────────────────────

/// OAuth descriptor as written in a backend's configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub device_auth_url: String,
    #[serde(default)]
    pub token_url: String,
}

impl OAuthConfig {
    /// Resolve the endpoints the device flow talks to.
    ///
    /// Returns `None` when the descriptor lacks a client id or token URL.
    pub fn provider_config(&self) -> Option<ProviderConfig> {
        if self.client_id.is_empty() || self.token_url.is_empty() {
            return None;
        }
        Some(ProviderConfig {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone().filter(|s| !s.is_empty()),
            device_auth_url: self.device_auth_url.clone(),
            token_url: self.token_url.clone(),
            scopes: self.scopes.clone(),
        })
    }
}

/// Resolved device-flow endpoints and client credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub device_auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
}

// ─── Wire Types ──────────────────────────────────────────────────────────────

/// Response from the device-authorization endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    #[serde(alias = "verification_url")]
    pub verification_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_uri_complete: Option<String>,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default)]
    pub interval: u64,
}

/// Response from the token endpoint, success or error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl TokenResponse {
    /// Convert a successful response to a token, stamping expiry relative to `now`.
    pub fn into_token(self, now: DateTime<Utc>) -> Option<OAuthToken> {
        let access_token = self.access_token.filter(|t| !t.is_empty())?;
        Some(OAuthToken {
            access_token,
            token_type: self.token_type.unwrap_or_else(|| "Bearer".into()),
            refresh_token: self.refresh_token,
            scope: self.scope,
            expires_at: self
                .expires_in
                .filter(|secs| *secs > 0)
                .map(|secs| now + ChronoDuration::seconds(secs)),
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn token_expiring_in(secs: i64, now: DateTime<Utc>) -> OAuthToken {
        OAuthToken {
            expires_at: Some(now + ChronoDuration::seconds(secs)),
            ..OAuthToken::bearer("abc")
        }
    }

    #[test]
    fn test_expiry_buffer() {
        let now = Utc::now();
        assert!(token_expiring_in(4 * 60, now).is_expired_at(now));
        assert!(token_expiring_in(-10, now).is_expired_at(now));
        assert!(!token_expiring_in(6 * 60, now).is_expired_at(now));
        assert!(!OAuthToken::bearer("abc").is_expired_at(now));
    }

    #[test]
    fn test_authorization_header_defaults_to_bearer() {
        let mut token = OAuthToken::bearer("xyz");
        assert_eq!(token.authorization_header(), "Bearer xyz");
        token.token_type = String::new();
        assert_eq!(token.authorization_header(), "Bearer xyz");
        token.token_type = "token".into();
        assert_eq!(token.authorization_header(), "token xyz");
    }

    #[test]
    fn test_provider_config_requires_client_and_token_url() {
        let mut cfg = OAuthConfig {
            client_id: "cid".into(),
            client_secret: Some(String::new()),
            ..Default::default()
        };
        assert!(cfg.provider_config().is_none());

        cfg.token_url = "https://example.com/token".into();
        let provider = cfg.provider_config().unwrap();
        assert_eq!(provider.client_id, "cid");
        assert_eq!(provider.client_secret, None);
    }

    #[test]
    fn test_token_status() {
        let now = Utc::now();
        let status = TokenStatus::for_token(&token_expiring_in(3600, now), now);
        assert!(status.authenticated);
        assert_eq!(status.status, "valid");
        assert_eq!(status.expires_in_secs, Some(3600));

        let status = TokenStatus::for_token(&token_expiring_in(60, now), now);
        assert!(!status.authenticated);
        assert_eq!(status.status, "expired");
        assert_eq!(status.expires_in_secs, None);
    }

    #[test]
    fn test_token_response_into_token() {
        let now = Utc::now();
        let resp: TokenResponse = serde_json::from_str(
            r#"{"access_token":"gho_1","token_type":"bearer","scope":"repo","expires_in":28800}"#,
        )
        .unwrap();
        let token = resp.into_token(now).unwrap();
        assert_eq!(token.access_token, "gho_1");
        assert_eq!(token.expires_at, Some(now + ChronoDuration::seconds(28800)));

        let pending: TokenResponse =
            serde_json::from_str(r#"{"error":"authorization_pending"}"#).unwrap();
        assert!(pending.into_token(now).is_none());
    }
}
