//! Credential sources for the auth modes a connection can use.

use super::token::{AuthError, CredentialSource, Credentials};
use crate::clock::SharedClock;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

fn token_client(timeout: Duration) -> Result<reqwest::Client, AuthError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AuthError::Unavailable(e.to_string()))
}

/// POST a form to a token endpoint and decode the standard OAuth response.
async fn request_token(
    client: &reqwest::Client,
    url: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse, AuthError> {
    let response = client
        .post(url)
        .form(form)
        .send()
        .await
        .map_err(|e| AuthError::Unavailable(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = format!("{} returned {}: {}", url, status, body);
        return Err(match status {
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                AuthError::Rejected(message)
            }
            _ => AuthError::Unavailable(message),
        });
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| AuthError::Unavailable(format!("invalid token response: {}", e)))
}

fn into_credentials(token: TokenResponse, clock: &SharedClock) -> Credentials {
    let expires_at = token
        .expires_in
        .map(|secs| clock.now() + ChronoDuration::seconds(secs));
    Credentials {
        token_type: token.token_type.unwrap_or_else(|| "Bearer".to_string()),
        ..Credentials::bearer(token.access_token, expires_at)
    }
}

/// OAuth2 client-credentials grant.
pub struct ClientCredentials {
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: Option<String>,
    client: reqwest::Client,
    clock: SharedClock,
}

impl ClientCredentials {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        scope: Option<String>,
        timeout: Duration,
        clock: SharedClock,
    ) -> Result<Self, AuthError> {
        Ok(Self {
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope,
            client: token_client(timeout)?,
            clock,
        })
    }
}

#[async_trait]
impl CredentialSource for ClientCredentials {
    fn mode(&self) -> &'static str {
        "client_credentials"
    }

    async fn fetch(&self) -> Result<Credentials, AuthError> {
        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        if let Some(scope) = &self.scope {
            form.push(("scope", scope.as_str()));
        }
        let token = request_token(&self.client, &self.token_url, &form).await?;
        Ok(into_credentials(token, &self.clock))
    }
}

/// OAuth2 refresh-token grant. Rotated refresh tokens replace the old one.
pub struct RefreshToken {
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
    refresh_token: Mutex<String>,
    client: reqwest::Client,
    clock: SharedClock,
}

impl RefreshToken {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<String>,
        refresh_token: impl Into<String>,
        timeout: Duration,
        clock: SharedClock,
    ) -> Result<Self, AuthError> {
        Ok(Self {
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
            refresh_token: Mutex::new(refresh_token.into()),
            client: token_client(timeout)?,
            clock,
        })
    }
}

#[async_trait]
impl CredentialSource for RefreshToken {
    fn mode(&self) -> &'static str {
        "refresh_token"
    }

    async fn fetch(&self) -> Result<Credentials, AuthError> {
        let mut refresh_token = self.refresh_token.lock().await;
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let mut token = request_token(&self.client, &self.token_url, &form).await?;
        if let Some(rotated) = token.refresh_token.take() {
            tracing::debug!("Refresh token rotated");
            *refresh_token = rotated;
        }
        Ok(into_credentials(token, &self.clock))
    }
}

/// Fixed API key. Never expires, so it is fetched once.
pub struct StaticKey {
    credentials: Credentials,
}

impl StaticKey {
    /// `header` sends the raw key in a custom header; otherwise the key goes
    /// into `Authorization` prefixed by `scheme` (empty for no prefix).
    pub fn new(key: impl Into<String>, header: Option<String>, scheme: Option<String>) -> Self {
        Self {
            credentials: Credentials {
                token_type: scheme.unwrap_or_default(),
                header_name: header,
                ..Credentials::bearer(key, None)
            },
        }
    }
}

#[async_trait]
impl CredentialSource for StaticKey {
    fn mode(&self) -> &'static str {
        "api_key"
    }

    async fn fetch(&self) -> Result<Credentials, AuthError> {
        Ok(self.credentials.clone())
    }
}
