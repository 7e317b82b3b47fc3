//! OAuth 2.0 device authorization grant (RFC 8628).
//!
//! The user approves access in a browser while we poll the token endpoint.
//! Pacing follows the provider: `slow_down` widens the interval, and terminal
//! answers stop the loop.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;

use super::errors::OAuthError;
use super::store::TokenStore;
use super::types::{DeviceCodeResponse, OAuthToken, ProviderConfig, TokenResponse};

/// Grant type sent on every poll.
const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

// ─── Poll Classification ─────────────────────────────────────────────────────

/// What one poll of the token endpoint told us.
#[derive(Debug)]
pub enum PollOutcome {
    Granted(OAuthToken),
    Pending,
    SlowDown,
    Failed(OAuthError),
}

/// Classify a token-endpoint answer.
pub fn classify(response: TokenResponse) -> PollOutcome {
    match response.error.as_deref() {
        None | Some("") => match response.into_token(Utc::now()) {
            Some(token) => PollOutcome::Granted(token),
            None => PollOutcome::Failed(OAuthError::Decode {
                what: "token response".into(),
                reason: "missing access_token".into(),
            }),
        },
        Some("authorization_pending") => PollOutcome::Pending,
        Some("slow_down") => PollOutcome::SlowDown,
        Some("expired_token") => PollOutcome::Failed(OAuthError::ExpiredToken),
        Some("access_denied") => PollOutcome::Failed(OAuthError::AccessDenied),
        Some(other) => PollOutcome::Failed(OAuthError::Provider {
            error: other.to_string(),
            description: response.error_description.unwrap_or_default(),
        }),
    }
}

// ─── Device Flow ─────────────────────────────────────────────────────────────

impl TokenStore {
    /// Ask the provider for a device code and user code.
    pub async fn start_device_flow(
        &self,
        provider: &ProviderConfig,
    ) -> Result<DeviceCodeResponse, OAuthError> {
        if provider.device_auth_url.is_empty() {
            return Err(OAuthError::NotConfigured {
                reason: "device authorization URL not configured".into(),
            });
        }

        let mut form: Vec<(&str, &str)> = vec![("client_id", provider.client_id.as_str())];
        for scope in &provider.scopes {
            form.push(("scope", scope.as_str()));
        }

        let endpoint = provider.device_auth_url.as_str();
        let response = self
            .http
            .post(endpoint)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| http_error(endpoint, e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| http_error(endpoint, e))?;
        if !status.is_success() {
            return Err(OAuthError::Http {
                endpoint: endpoint.to_string(),
                reason: format!("device auth failed with status {}: {body}", status.as_u16()),
            });
        }

        let device: DeviceCodeResponse =
            serde_json::from_str(&body).map_err(|e| OAuthError::Decode {
                what: "device auth response".into(),
                reason: e.to_string(),
            })?;

        tracing::info!(
            verification_uri = %device.verification_uri,
            user_code = %device.user_code,
            interval = device.interval,
            "device flow started"
        );
        Ok(device)
    }

    /// Poll until the user authorizes, then persist the token under `name`.
    pub async fn poll_for_token(
        &self,
        name: &str,
        provider: &ProviderConfig,
        device: &DeviceCodeResponse,
    ) -> Result<OAuthToken, OAuthError> {
        let interval = Duration::from_secs(device.interval);
        let lifetime = (device.expires_in > 0).then(|| Duration::from_secs(device.expires_in));

        let token = self
            .poll_with(interval, lifetime, || self.request_token(provider, &device.device_code))
            .await?;

        self.set_token(name, token.clone())?;
        Ok(token)
    }

    /// Core polling loop, independent of how each poll is performed.
    pub(crate) async fn poll_with<F, Fut>(
        &self,
        interval: Duration,
        lifetime: Option<Duration>,
        mut poll: F,
    ) -> Result<OAuthToken, OAuthError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<TokenResponse, OAuthError>>,
    {
        let started = tokio::time::Instant::now();
        let mut interval = interval.max(self.poll.min_interval);

        loop {
            if let Some(lifetime) = lifetime {
                if started.elapsed() + interval > lifetime {
                    return Err(OAuthError::PollTimeout {
                        elapsed_secs: started.elapsed().as_secs(),
                    });
                }
            }
            tokio::time::sleep(interval).await;

            match classify(poll().await?) {
                PollOutcome::Granted(token) => return Ok(token),
                PollOutcome::Pending => continue,
                PollOutcome::SlowDown => {
                    interval += self.poll.slow_down_step;
                    tracing::debug!(interval_secs = interval.as_secs(), "provider asked to slow down");
                }
                PollOutcome::Failed(e) => return Err(e),
            }
        }
    }

    async fn request_token(
        &self,
        provider: &ProviderConfig,
        device_code: &str,
    ) -> Result<TokenResponse, OAuthError> {
        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", provider.client_id.as_str()),
            ("device_code", device_code),
            ("grant_type", DEVICE_CODE_GRANT),
        ];
        if let Some(secret) = provider.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let endpoint = provider.token_url.as_str();
        let response = self
            .http
            .post(endpoint)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| http_error(endpoint, e))?;

        // Providers report pending/slow_down with 400 and a JSON body, so the
        // body is decoded regardless of status.
        let body = response.text().await.map_err(|e| http_error(endpoint, e))?;
        serde_json::from_str(&body).map_err(|e| OAuthError::Decode {
            what: "token response".into(),
            reason: e.to_string(),
        })
    }
}

fn http_error(endpoint: &str, e: reqwest::Error) -> OAuthError {
    OAuthError::Http {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::time::Instant;

    use super::super::store::PollSettings;
    use super::*;

    fn answer(json: &str) -> TokenResponse {
        serde_json::from_str(json).unwrap()
    }

    fn scripted(
        answers: Vec<&str>,
    ) -> (
        Arc<Mutex<VecDeque<TokenResponse>>>,
        Arc<Mutex<Vec<Instant>>>,
    ) {
        let queue = answers.into_iter().map(answer).collect();
        (Arc::new(Mutex::new(queue)), Arc::new(Mutex::new(Vec::new())))
    }

    fn provider(base: &str) -> ProviderConfig {
        ProviderConfig {
            client_id: "cid".into(),
            client_secret: None,
            device_auth_url: format!("{base}/device/code"),
            token_url: format!("{base}/oauth/token"),
            scopes: vec!["repo".into(), "read:user".into()],
        }
    }

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify(answer(r#"{"error":"authorization_pending"}"#)),
            PollOutcome::Pending
        ));
        assert!(matches!(classify(answer(r#"{"error":"slow_down"}"#)), PollOutcome::SlowDown));
        assert!(matches!(
            classify(answer(r#"{"error":"expired_token"}"#)),
            PollOutcome::Failed(OAuthError::ExpiredToken)
        ));
        assert!(matches!(
            classify(answer(r#"{"error":"access_denied"}"#)),
            PollOutcome::Failed(OAuthError::AccessDenied)
        ));
        match classify(answer(r#"{"error":"unsupported_grant_type","error_description":"nope"}"#)) {
            PollOutcome::Failed(e) => {
                assert_eq!(e.to_string(), "token error: unsupported_grant_type - nope")
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(matches!(
            classify(answer(r#"{"access_token":"t","token_type":"bearer"}"#)),
            PollOutcome::Granted(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_down_widens_interval_and_continues() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TokenStore::open(tmp.path()).unwrap();
        let (answers, calls) = scripted(vec![
            r#"{"error":"authorization_pending"}"#,
            r#"{"error":"slow_down"}"#,
            r#"{"error":"authorization_pending"}"#,
            r#"{"access_token":"granted","token_type":"bearer"}"#,
        ]);

        let start = Instant::now();
        let token = store
            .poll_with(Duration::from_secs(1), None, || {
                let answers = answers.clone();
                let calls = calls.clone();
                async move {
                    calls.lock().push(Instant::now());
                    Ok(answers.lock().pop_front().unwrap())
                }
            })
            .await
            .unwrap();
        assert_eq!(token.access_token, "granted");

        // The 1s provider interval is floored to 5s; slow_down adds 5s.
        let offsets: Vec<u64> = calls
            .lock()
            .iter()
            .map(|t| t.duration_since(start).as_secs())
            .collect();
        assert_eq!(offsets, vec![5, 10, 20, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_token_is_terminal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TokenStore::open(tmp.path()).unwrap();
        let (answers, calls) = scripted(vec![
            r#"{"error":"authorization_pending"}"#,
            r#"{"error":"expired_token"}"#,
            r#"{"access_token":"never-reached"}"#,
        ]);

        let err = store
            .poll_with(Duration::from_secs(5), None, || {
                let answers = answers.clone();
                let calls = calls.clone();
                async move {
                    calls.lock().push(Instant::now());
                    Ok(answers.lock().pop_front().unwrap())
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::ExpiredToken));
        assert_eq!(calls.lock().len(), 2);
        assert_eq!(answers.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_when_device_code_lifetime_elapses() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TokenStore::open(tmp.path()).unwrap();

        let err = store
            .poll_with(Duration::from_secs(5), Some(Duration::from_secs(12)), || async {
                Ok(answer(r#"{"error":"authorization_pending"}"#))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::PollTimeout { .. }));
    }

    #[tokio::test]
    async fn test_start_device_flow_posts_form() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/device/code")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("client_id".into(), "cid".into()),
                mockito::Matcher::Regex("scope=repo".into()),
                mockito::Matcher::Regex("scope=read%3Auser".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"device_code":"dc","user_code":"ABCD-1234","verification_uri":"https://example.com/device","expires_in":900,"interval":5}"#,
            )
            .create_async()
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let store = TokenStore::open(tmp.path()).unwrap();
        let device = store.start_device_flow(&provider(&server.url())).await.unwrap();

        assert_eq!(device.user_code, "ABCD-1234");
        assert_eq!(device.interval, 5);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_start_device_flow_requires_url() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TokenStore::open(tmp.path()).unwrap();
        let mut cfg = provider("http://unused");
        cfg.device_auth_url.clear();
        let err = store.start_device_flow(&cfg).await.unwrap_err();
        assert!(matches!(err, OAuthError::NotConfigured { .. }));
    }

    #[tokio::test]
    async fn test_poll_for_token_persists_grant() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("device_code".into(), "dc".into()),
                mockito::Matcher::UrlEncoded("grant_type".into(), DEVICE_CODE_GRANT.into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"gho_new","token_type":"bearer","scope":"repo","expires_in":3600}"#)
            .create_async()
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let store = TokenStore::open(tmp.path()).unwrap().with_poll_settings(PollSettings {
            min_interval: Duration::from_millis(10),
            slow_down_step: Duration::from_millis(10),
        });
        let device = DeviceCodeResponse {
            device_code: "dc".into(),
            user_code: "ABCD".into(),
            verification_uri: "https://example.com/device".into(),
            verification_uri_complete: None,
            expires_in: 0,
            interval: 0,
        };

        let token = store
            .poll_for_token("github", &provider(&server.url()), &device)
            .await
            .unwrap();
        assert_eq!(token.access_token, "gho_new");
        assert!(store.has_valid_token("github"));
        assert!(tmp.path().join("github.json").exists());
        mock.assert_async().await;
    }
}
