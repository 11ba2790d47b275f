use crate::auth::{
    AuthError, ClientCredentials, CredentialSource, RefreshToken, RefresherSettings, StaticKey, TokenRefresher,
};
use crate::clock::SharedClock;
use crate::config::types::{AuthConfig, ConnectionConfig};
use crate::error::ConnectorError;
use crate::http::{HttpClient, RetryPolicy};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Build the shared client of one configured connection.
///
/// `stop` aborts in-flight retries and token fetches on shutdown.
pub fn build_client(
    name: &str,
    config: &ConnectionConfig,
    clock: SharedClock,
    stop: CancellationToken,
) -> Result<HttpClient, ConnectorError> {
    let mut builder = HttpClient::builder(name)
        .timeout(config.timeout)
        .retry(RetryPolicy::new(config.max_retries, config.backoff_base))
        .default_headers(header_map(name, config)?)
        .stop_token(stop.clone())
        .clock(clock.clone());

    if let Some(limit) = config.rate_limit {
        builder = builder.rate_limit(limit);
    }
    for (prefix, limit) in &config.endpoint_rate_limits {
        builder = builder.endpoint_rate_limit(prefix.clone(), *limit);
    }
    if let Some(auth) = &config.auth {
        let refresher = token_refresher(name, auth, config.timeout, clock, stop)?;
        builder = builder.auth(Arc::new(refresher));
    }

    builder
        .build()
        .map_err(|e| ConnectorError::Config(format!("connection '{}': {}", name, e)))
}

fn token_refresher(
    name: &str,
    auth: &AuthConfig,
    timeout: Duration,
    clock: SharedClock,
    stop: CancellationToken,
) -> Result<TokenRefresher, ConnectorError> {
    let invalid = |e: AuthError| ConnectorError::Config(format!("connection '{}' auth: {}", name, e));

    let (source, safety_margin): (Box<dyn CredentialSource>, Duration) = match auth {
        AuthConfig::ClientCredentials {
            token_url,
            client_id,
            client_secret,
            scope,
            safety_margin,
        } => (
            Box::new(
                ClientCredentials::new(
                    token_url,
                    client_id,
                    client_secret,
                    scope.clone(),
                    timeout,
                    clock.clone(),
                )
                .map_err(invalid)?,
            ),
            *safety_margin,
        ),
        AuthConfig::RefreshToken {
            token_url,
            client_id,
            client_secret,
            refresh_token,
            safety_margin,
        } => (
            Box::new(
                RefreshToken::new(
                    token_url,
                    client_id,
                    client_secret.clone(),
                    refresh_token,
                    timeout,
                    clock.clone(),
                )
                .map_err(invalid)?,
            ),
            *safety_margin,
        ),
        AuthConfig::ApiKey { key, header, scheme } => (
            Box::new(StaticKey::new(key, header.clone(), scheme.clone())),
            Duration::ZERO,
        ),
    };

    let settings = RefresherSettings {
        safety_margin,
        ..RefresherSettings::default()
    };
    Ok(TokenRefresher::new(name, source, settings, clock, stop))
}

fn header_map(name: &str, config: &ConnectionConfig) -> Result<HeaderMap, ConnectorError> {
    let mut headers = HeaderMap::new();
    for (key, value) in &config.headers {
        let header = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
            ConnectorError::Config(format!("connection '{}' header '{}': {}", name, key, e))
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            ConnectorError::Config(format!("connection '{}' header '{}': {}", name, key, e))
        })?;
        headers.insert(header, value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use crate::error::ErrorKind;
    use std::collections::BTreeMap;

    fn connection(auth: Option<AuthConfig>) -> ConnectionConfig {
        ConnectionConfig {
            auth,
            rate_limit: None,
            endpoint_rate_limits: BTreeMap::new(),
            timeout: Duration::from_secs(5),
            max_retries: 2,
            backoff_base: Duration::from_millis(100),
            headers: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_builds_authenticated_client() {
        let auth = AuthConfig::ApiKey {
            key: "k".to_string(),
            header: None,
            scheme: Some("SSWS".to_string()),
        };
        let client = build_client("idp", &connection(Some(auth)), clock::system(), CancellationToken::new())
            .unwrap();
        assert_eq!(client.name(), "idp");
        assert!(client.refresher().is_some());
    }

    #[tokio::test]
    async fn test_plain_connection_has_no_refresher() {
        let client = build_client("open", &connection(None), clock::system(), CancellationToken::new())
            .unwrap();
        assert!(client.refresher().is_none());
    }

    #[tokio::test]
    async fn test_invalid_header_is_a_config_error() {
        let mut config = connection(None);
        config.headers.insert("bad header".to_string(), "x".to_string());
        let err = build_client("c", &config, clock::system(), CancellationToken::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
