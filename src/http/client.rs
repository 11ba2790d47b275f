use super::rate_limit::{RateLimit, RateLimiter};
use super::retry::{parse_retry_after, sleep_or_stop, RetryPolicy};
use super::HttpError;
use crate::auth::TokenRefresher;
use crate::clock::{self, SharedClock};
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, HttpError>;

/// HTTP client with retries, rate limiting and token refresh.
///
/// Cheap to clone; clones share the same connection pool, rate limiter and
/// token refresher.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    name: String,
    client: reqwest::Client,
    timeout: Duration,
    retry: RetryPolicy,
    limiter: Option<RateLimiter>,
    endpoint_limiters: Vec<(String, RateLimiter)>,
    auth: Option<Arc<TokenRefresher>>,
    stop: CancellationToken,
    clock: SharedClock,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("name", &self.inner.name)
            .field("timeout", &self.inner.timeout)
            .field("retry", &self.inner.retry)
            .field("authenticated", &self.inner.auth.is_some())
            .finish()
    }
}

pub struct HttpClientBuilder {
    name: String,
    timeout: Duration,
    connect_timeout: Duration,
    retry: RetryPolicy,
    rate_limit: Option<RateLimit>,
    endpoint_limits: Vec<(String, RateLimit)>,
    auth: Option<Arc<TokenRefresher>>,
    default_headers: HeaderMap,
    stop: CancellationToken,
    clock: SharedClock,
}

impl HttpClientBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    /// Use a dedicated bucket for URLs whose path starts with `path_prefix`.
    pub fn endpoint_rate_limit(mut self, path_prefix: impl Into<String>, limit: RateLimit) -> Self {
        self.endpoint_limits.push((path_prefix.into(), limit));
        self
    }

    pub fn auth(mut self, refresher: Arc<TokenRefresher>) -> Self {
        self.auth = Some(refresher);
        self
    }

    pub fn default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = headers;
        self
    }

    pub fn stop_token(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<HttpClient> {
        let client = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .default_headers(self.default_headers)
            .user_agent(concat!("conveyor/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(HttpClient {
            inner: Arc::new(ClientInner {
                name: self.name,
                client,
                timeout: self.timeout,
                retry: self.retry,
                limiter: self.rate_limit.map(RateLimiter::new),
                endpoint_limiters: self
                    .endpoint_limits
                    .into_iter()
                    .map(|(prefix, limit)| (prefix, RateLimiter::new(limit)))
                    .collect(),
                auth: self.auth,
                stop: self.stop,
                clock: self.clock,
            }),
        })
    }
}

/// What the retry loop should do after one attempt.
enum Attempt {
    Done(Response),
    Retry { reason: String, hint: Option<Duration> },
}

impl HttpClient {
    pub fn builder(name: impl Into<String>) -> HttpClientBuilder {
        HttpClientBuilder {
            name: name.into(),
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            rate_limit: None,
            endpoint_limits: Vec::new(),
            auth: None,
            default_headers: HeaderMap::new(),
            stop: CancellationToken::new(),
            clock: clock::system(),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn refresher(&self) -> Option<&Arc<TokenRefresher>> {
        self.inner.auth.as_ref()
    }

    pub async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        headers: Option<&HeaderMap>,
    ) -> Result<Response> {
        self.execute(Method::GET, url, query, None, headers, Some(self.inner.timeout))
            .await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(String, String)],
        headers: Option<&HeaderMap>,
    ) -> Result<T> {
        let response = self.get(url, query, headers).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn post<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        headers: Option<&HeaderMap>,
    ) -> Result<Response> {
        let body = serde_json::to_vec(body)?;
        self.execute(Method::POST, url, &[], Some(body), headers, Some(self.inner.timeout))
            .await
    }

    /// Open a long-lived GET and read it line by line.
    ///
    /// Only establishing the connection is retried; once lines flow, a broken
    /// stream surfaces as an error from [`LineStream::next_line`].
    pub async fn stream(
        &self,
        url: &str,
        query: &[(String, String)],
        headers: Option<&HeaderMap>,
    ) -> Result<LineStream> {
        let response = self.execute(Method::GET, url, query, None, headers, None).await?;
        Ok(LineStream {
            response,
            buffer: Vec::new(),
            finished: false,
            stop: self.inner.stop.clone(),
        })
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        body: Option<Vec<u8>>,
        headers: Option<&HeaderMap>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let inner = &self.inner;
        let mut retries = 0u32;
        let mut refreshed = false;

        loop {
            let attempt = retries + 1;
            self.throttle(url).await?;

            let credentials = match &inner.auth {
                Some(refresher) => Some(refresher.credentials().await?),
                None => None,
            };

            let mut request = inner.client.request(method.clone(), url);
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(headers) = headers {
                request = request.headers(headers.clone());
            }
            if let Some(credentials) = &credentials {
                let (name, value) = credentials.header().map_err(HttpError::Header)?;
                request = request.header(name, value);
            }
            if let Some(body) = &body {
                request = request
                    .header(CONTENT_TYPE, "application/json")
                    .body(body.clone());
            }
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            let sent = tokio::select! {
                result = request.send() => result,
                _ = inner.stop.cancelled() => return Err(HttpError::Shutdown),
            };

            let outcome = match sent {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::UNAUTHORIZED {
                        match (&inner.auth, refreshed) {
                            (Some(refresher), false) => {
                                refreshed = true;
                                tracing::warn!(
                                    client = %inner.name,
                                    url = %url,
                                    "Received 401, forcing token refresh"
                                );
                                refresher.force_refresh(credentials.as_ref()).await?;
                                continue;
                            }
                            _ => {
                                return Err(HttpError::Auth(format!(
                                    "{} {} returned 401",
                                    method, url
                                )))
                            }
                        }
                    }
                    self.classify(response, url, attempt).await?
                }
                Err(e) if e.is_builder() => return Err(HttpError::Request(e)),
                Err(e) => {
                    if retries >= inner.retry.max_retries {
                        return Err(HttpError::Exhausted {
                            attempts: attempt,
                            last: e.to_string(),
                        });
                    }
                    Attempt::Retry {
                        reason: e.to_string(),
                        hint: None,
                    }
                }
            };

            match outcome {
                Attempt::Done(response) => return Ok(response),
                Attempt::Retry { reason, hint } => {
                    retries += 1;
                    let delay = inner.retry.delay_with_hint(retries, hint);
                    tracing::warn!(
                        client = %inner.name,
                        url = %url,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Request failed, retrying"
                    );
                    if !sleep_or_stop(delay, &inner.stop).await {
                        return Err(HttpError::Shutdown);
                    }
                }
            }
        }
    }

    /// Turn a non-401 response into a result or a retry decision.
    async fn classify(&self, response: Response, url: &str, attempt: u32) -> Result<Attempt> {
        let status = response.status();
        if status.is_success() {
            return Ok(Attempt::Done(response));
        }

        let exhausted = attempt > self.inner.retry.max_retries;

        if status == StatusCode::TOO_MANY_REQUESTS {
            if exhausted {
                return Err(HttpError::RateLimited { attempts: attempt });
            }
            let hint = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, self.inner.clock.now()));
            return Ok(Attempt::Retry {
                reason: status.to_string(),
                hint,
            });
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            if exhausted {
                return Err(HttpError::Exhausted {
                    attempts: attempt,
                    last: format!("{}: {}", status, body),
                });
            }
            return Ok(Attempt::Retry {
                reason: status.to_string(),
                hint: None,
            });
        }

        Err(HttpError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn throttle(&self, url: &str) -> Result<()> {
        let Some(limiter) = self.limiter_for(url) else {
            return Ok(());
        };
        tokio::select! {
            _ = limiter.acquire() => Ok(()),
            _ = self.inner.stop.cancelled() => Err(HttpError::Shutdown),
        }
    }

    fn limiter_for(&self, url: &str) -> Option<&RateLimiter> {
        if !self.inner.endpoint_limiters.is_empty() {
            if let Ok(parsed) = reqwest::Url::parse(url) {
                let path = parsed.path();
                let best = self
                    .inner
                    .endpoint_limiters
                    .iter()
                    .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
                    .max_by_key(|(prefix, _)| prefix.len());
                if let Some((_, limiter)) = best {
                    return Some(limiter);
                }
            }
        }
        self.inner.limiter.as_ref()
    }
}

/// Newline-delimited reader over a streaming response body.
pub struct LineStream {
    response: Response,
    buffer: Vec<u8>,
    finished: bool,
    stop: CancellationToken,
}

impl LineStream {
    /// Next line without its terminator, or `None` once the server closed
    /// the stream.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            if self.finished {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let rest = std::mem::take(&mut self.buffer);
                return Ok(Some(String::from_utf8_lossy(&rest).into_owned()));
            }

            let chunk = tokio::select! {
                chunk = self.response.chunk() => chunk?,
                _ = self.stop.cancelled() => return Err(HttpError::Shutdown),
            };
            match chunk {
                Some(bytes) => self.buffer.extend_from_slice(&bytes),
                None => self.finished = true,
            }
        }
    }
}

