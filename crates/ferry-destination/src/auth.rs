//! Bearer token providers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::DestinationError;

/// Tokens are renewed this long before they expire.
const REFRESH_MARGIN_SECS: i64 = 300;

/// Source of the `Authorization: Bearer` token for destination calls.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String, DestinationError>;

    /// Drop any cached token after the destination rejected it.
    async fn invalidate(&self) {}
}

/// A fixed, preconfigured token.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn bearer_token(&self) -> Result<String, DestinationError> {
        Ok(self.0.clone())
    }
}

/// Tries the configured provider first, then the static fallback token.
pub struct Credentials {
    primary: Option<Arc<dyn TokenProvider>>,
    fallback: Option<String>,
}

impl Credentials {
    pub fn new(primary: Option<Arc<dyn TokenProvider>>, fallback: Option<String>) -> Self {
        Self {
            primary,
            fallback: fallback.filter(|t| !t.trim().is_empty()),
        }
    }

    pub fn static_only(token: impl Into<String>) -> Self {
        Self::new(None, Some(token.into()))
    }
}

#[async_trait]
impl TokenProvider for Credentials {
    async fn bearer_token(&self) -> Result<String, DestinationError> {
        if let Some(primary) = &self.primary {
            match primary.bearer_token().await {
                Ok(token) => return Ok(token),
                Err(e) if self.fallback.is_some() => {
                    warn!(error = %e, "token provider failed, using static token");
                }
                Err(e) => return Err(e),
            }
        }
        self.fallback
            .clone()
            .ok_or_else(|| DestinationError::Auth("no token provider configured".to_string()))
    }

    async fn invalidate(&self) {
        if let Some(primary) = &self.primary {
            primary.invalidate().await;
        }
    }
}

/// OpenID Connect settings for the password grant.
#[derive(Debug, Clone)]
pub struct KeycloakConfig {
    pub server_url: String,
    pub realm: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
    /// Give up retrying a token fetch after this long.
    pub max_retry_elapsed: Duration,
}

impl KeycloakConfig {
    fn token_url(&self) -> String {
        format!(
            "{}/realms/{}/protocol/openid-connect/token",
            self.server_url.trim_end_matches('/'),
            self.realm
        )
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    refresh_token: Option<String>,
    refresh_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.refresh_at.is_none_or(|at| now < at)
    }
}

/// Password-grant token source with caching and refresh.
pub struct KeycloakTokens {
    http: Client,
    config: KeycloakConfig,
    cached: Mutex<Option<CachedToken>>,
}

impl KeycloakTokens {
    pub fn new(config: KeycloakConfig) -> Result<Self, DestinationError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            config,
            cached: Mutex::new(None),
        })
    }

    /// One token request. Transport faults and 5xx replies are transient.
    async fn request_token(
        &self,
        form: &[(&str, &str)],
    ) -> Result<CachedToken, backoff::Error<DestinationError>> {
        let response = self
            .http
            .post(self.config.token_url())
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| backoff::Error::transient(DestinationError::Http(e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = DestinationError::Auth(format!("token request failed ({}): {}", status, text));
            return Err(if status.is_server_error() {
                backoff::Error::transient(err)
            } else {
                backoff::Error::permanent(err)
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| backoff::Error::permanent(DestinationError::Http(e)))?;
        let refresh_at = token
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs - REFRESH_MARGIN_SECS));
        debug!(expires_in = ?token.expires_in, "obtained access token");

        Ok(CachedToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            refresh_at,
        })
    }

    /// Password grant, retried with exponential backoff on transient failures.
    async fn password_grant(&self) -> Result<CachedToken, DestinationError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(5),
            max_elapsed_time: Some(self.config.max_retry_elapsed),
            ..Default::default()
        };

        loop {
            let result = self
                .request_token(&[
                    ("grant_type", "password"),
                    ("client_id", &self.config.client_id),
                    ("username", &self.config.username),
                    ("password", &self.config.password),
                ])
                .await;

            match result {
                Ok(token) => {
                    info!(username = %self.config.username, "generated access token");
                    return Ok(token);
                }
                Err(backoff::Error::Transient { err, .. }) => match backoff.next_backoff() {
                    Some(delay) => {
                        warn!(
                            error = %err,
                            delay_ms = delay.as_millis() as u64,
                            "token request failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(err),
                },
                Err(backoff::Error::Permanent(err)) => return Err(err),
            }
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<CachedToken, DestinationError> {
        self.request_token(&[
            ("grant_type", "refresh_token"),
            ("client_id", &self.config.client_id),
            ("refresh_token", refresh_token),
        ])
        .await
        .map_err(|e| match e {
            backoff::Error::Permanent(err) | backoff::Error::Transient { err, .. } => err,
        })
    }
}

#[async_trait]
impl TokenProvider for KeycloakTokens {
    async fn bearer_token(&self) -> Result<String, DestinationError> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.access_token.clone());
            }
        }

        let refresh_token = cached.as_ref().and_then(|t| t.refresh_token.clone());
        let renewed = match refresh_token {
            Some(refresh_token) => match self.refresh(&refresh_token).await {
                Ok(token) => {
                    info!("refreshed access token");
                    token
                }
                Err(e) => {
                    warn!(error = %e, "token refresh failed, requesting a new token");
                    self.password_grant().await?
                }
            },
            None => self.password_grant().await?,
        };

        let access_token = renewed.access_token.clone();
        *cached = Some(renewed);
        Ok(access_token)
    }

    async fn invalidate(&self) {
        if self.cached.lock().await.take().is_some() {
            debug!("discarded cached access token");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOKEN_PATH: &str = "/realms/ferry/protocol/openid-connect/token";

    fn config(server: &MockServer) -> KeycloakConfig {
        KeycloakConfig {
            server_url: server.uri(),
            realm: "ferry".to_string(),
            client_id: "ferry-cli".to_string(),
            username: "migrator".to_string(),
            password: "secret".to_string(),
            max_retry_elapsed: Duration::from_millis(500),
        }
    }

    struct Failing;

    #[async_trait]
    impl TokenProvider for Failing {
        async fn bearer_token(&self) -> Result<String, DestinationError> {
            Err(DestinationError::Auth("down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_credentials_fall_back_to_static() {
        let creds = Credentials::new(Some(Arc::new(Failing)), Some("static-token".to_string()));
        assert_eq!(creds.bearer_token().await.unwrap(), "static-token");
    }

    #[tokio::test]
    async fn test_credentials_without_fallback_propagate() {
        let creds = Credentials::new(Some(Arc::new(Failing)), Some("  ".to_string()));
        assert!(matches!(creds.bearer_token().await, Err(DestinationError::Auth(_))));

        let empty = Credentials::new(None, None);
        assert!(empty.bearer_token().await.is_err());
    }

    #[tokio::test]
    async fn test_password_grant_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type=password"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok-1",
                "refresh_token": "ref-1",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = KeycloakTokens::new(config(&server)).unwrap();
        assert_eq!(tokens.bearer_token().await.unwrap(), "tok-1");
        assert_eq!(tokens.bearer_token().await.unwrap(), "tok-1");
    }

    #[tokio::test]
    async fn test_near_expiry_uses_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type=password"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok-1",
                "refresh_token": "ref-1",
                "expires_in": 60
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok-2",
                "refresh_token": "ref-2",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = KeycloakTokens::new(config(&server)).unwrap();
        assert_eq!(tokens.bearer_token().await.unwrap(), "tok-1");
        assert_eq!(tokens.bearer_token().await.unwrap(), "tok-2");
    }

    #[tokio::test]
    async fn test_invalidate_forces_a_new_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type=password"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok-1",
                "expires_in": 3600
            })))
            .expect(2)
            .mount(&server)
            .await;

        let tokens = Arc::new(KeycloakTokens::new(config(&server)).unwrap());
        let creds = Credentials::new(Some(tokens.clone() as Arc<dyn TokenProvider>), None);
        assert_eq!(creds.bearer_token().await.unwrap(), "tok-1");
        creds.invalidate().await;
        assert!(tokens.cached.lock().await.is_none());
        assert_eq!(creds.bearer_token().await.unwrap(), "tok-1");
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_grant"))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = KeycloakTokens::new(config(&server)).unwrap();
        let err = tokens.bearer_token().await.unwrap_err();
        assert!(matches!(err, DestinationError::Auth(msg) if msg.contains("invalid_grant")));
    }
}
