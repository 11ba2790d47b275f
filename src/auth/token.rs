use crate::clock::{later, SharedClock};
use crate::error::ErrorKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION};
use std::fmt;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum AuthError {
    /// The credential endpoint refused us; retrying will not help
    #[error("credentials rejected: {0}")]
    Rejected(String),

    #[error("credential endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("credential refresh failed after {attempts} attempts, cooling down: {last}")]
    Failed {
        attempts: u32,
        last: String,
        rejected: bool,
    },

    #[error("shutdown requested")]
    Shutdown,
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Rejected(_) => ErrorKind::Auth,
            AuthError::Failed { rejected: true, .. } => ErrorKind::Auth,
            AuthError::Unavailable(_) | AuthError::Failed { .. } => ErrorKind::Transient,
            AuthError::Shutdown => ErrorKind::Shutdown,
        }
    }
}

/// Access material for one upstream API.
#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub access_token: String,
    /// Authorization scheme, e.g. `Bearer`
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    /// Send the raw token in this header instead of `Authorization`
    pub header_name: Option<String>,
    pub tenant: Option<String>,
    pub region: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("header_name", &self.header_name)
            .field("tenant", &self.tenant)
            .field("region", &self.region)
            .finish()
    }
}

impl Credentials {
    pub fn bearer(token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            access_token: token.into(),
            token_type: "Bearer".to_string(),
            expires_at,
            header_name: None,
            tenant: None,
            region: None,
        }
    }

    /// Usable at `now` with `margin` to spare. Tokens without expiry never go stale.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => later(now, margin) < expires_at,
            None => true,
        }
    }

    pub fn header(&self) -> Result<(HeaderName, HeaderValue), String> {
        let (name, value) = match &self.header_name {
            Some(name) => (
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| e.to_string())?,
                self.access_token.clone(),
            ),
            None if self.token_type.is_empty() => (AUTHORIZATION, self.access_token.clone()),
            None => (AUTHORIZATION, format!("{} {}", self.token_type, self.access_token)),
        };
        let mut value = HeaderValue::from_str(&value).map_err(|e| e.to_string())?;
        value.set_sensitive(true);
        Ok((name, value))
    }
}

/// Somewhere credentials come from: an OAuth endpoint, a static key.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    fn mode(&self) -> &'static str;

    async fn fetch(&self) -> Result<Credentials, AuthError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Uninitialized,
    Fetching,
    Valid,
    Refreshing,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RefresherSettings {
    /// Refresh when the token expires within this margin
    pub safety_margin: Duration,
    /// Fetch attempts per refresh before giving up
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// After a failed refresh, reads fail fast for this long
    pub cooldown: Duration,
}

impl Default for RefresherSettings {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_secs(60),
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct Slot {
    credentials: Option<Credentials>,
    failed_at: Option<Instant>,
    last_failure: Option<(String, bool)>,
    fetches: u64,
}

/// Keeps one set of credentials valid for everyone sharing a connection.
///
/// Reads that find the token stale queue on the slot lock, so at most one
/// fetch is in flight and waiters observe its result.
pub struct TokenRefresher {
    name: String,
    source: Box<dyn CredentialSource>,
    settings: RefresherSettings,
    clock: SharedClock,
    slot: Mutex<Slot>,
    state: StdMutex<TokenState>,
    stop: CancellationToken,
}

impl fmt::Debug for TokenRefresher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRefresher")
            .field("name", &self.name)
            .field("mode", &self.source.mode())
            .field("state", &self.status())
            .finish()
    }
}

impl TokenRefresher {
    pub fn new(
        name: impl Into<String>,
        source: Box<dyn CredentialSource>,
        settings: RefresherSettings,
        clock: SharedClock,
        stop: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            settings,
            clock,
            slot: Mutex::new(Slot::default()),
            state: StdMutex::new(TokenState::Uninitialized),
            stop,
        }
    }

    pub fn status(&self) -> TokenState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(TokenState::Failed)
    }

    /// How many successful fetches have happened.
    pub async fn fetch_count(&self) -> u64 {
        self.slot.lock().await.fetches
    }

    /// Current credentials, refreshing first if they are missing or about to expire.
    ///
    /// A token issued with less lifetime than the safety margin is handed out
    /// as is and refetched on the next call. A token that is already expired
    /// when it arrives counts as a failed attempt.
    pub async fn credentials(&self) -> Result<Credentials, AuthError> {
        let mut slot = self.slot.lock().await;

        if let Some(credentials) = &slot.credentials {
            if credentials.is_fresh(self.clock.now(), self.settings.safety_margin) {
                return Ok(credentials.clone());
            }
        }

        if let Some(err) = self.cooling_down(&slot) {
            return Err(err);
        }
        self.refresh_locked(&mut slot).await
    }

    /// Replace credentials the server rejected.
    ///
    /// If another caller already swapped `stale` out, the newer credentials
    /// are returned without another fetch.
    pub async fn force_refresh(
        &self,
        stale: Option<&Credentials>,
    ) -> Result<Credentials, AuthError> {
        let mut slot = self.slot.lock().await;

        if let (Some(current), Some(stale)) = (&slot.credentials, stale) {
            if current.access_token != stale.access_token {
                return Ok(current.clone());
            }
        }

        slot.credentials = None;
        self.refresh_locked(&mut slot).await
    }

    fn cooling_down(&self, slot: &Slot) -> Option<AuthError> {
        let failed_at = slot.failed_at?;
        if failed_at.elapsed() >= self.settings.cooldown {
            return None;
        }
        let (last, rejected) = slot
            .last_failure
            .clone()
            .unwrap_or_else(|| ("unknown".to_string(), false));
        Some(AuthError::Failed {
            attempts: self.settings.max_attempts,
            last,
            rejected,
        })
    }

    async fn refresh_locked(&self, slot: &mut Slot) -> Result<Credentials, AuthError> {
        self.set_state(if slot.fetches == 0 {
            TokenState::Fetching
        } else {
            TokenState::Refreshing
        });

        let max_attempts = self.settings.max_attempts.max(1);
        let mut last = String::new();
        let mut rejected = false;
        let mut attempts = 0;

        for attempt in 1..=max_attempts {
            attempts = attempt;
            let fetched = tokio::select! {
                result = self.source.fetch() => result,
                _ = self.stop.cancelled() => Err(AuthError::Shutdown),
            };
            let fetched = fetched.and_then(|credentials| match credentials.expires_at {
                Some(at) if at <= self.clock.now() => Err(AuthError::Unavailable(format!(
                    "issued token already expired at {}",
                    at
                ))),
                _ => Ok(credentials),
            });

            match fetched {
                Ok(credentials) => {
                    if !credentials.is_fresh(self.clock.now(), self.settings.safety_margin) {
                        tracing::warn!(
                            connection = %self.name,
                            expires_at = ?credentials.expires_at,
                            "Fetched token already expires within the safety margin"
                        );
                    }
                    tracing::info!(
                        connection = %self.name,
                        mode = self.source.mode(),
                        expires_at = ?credentials.expires_at,
                        "Fetched credentials"
                    );
                    slot.credentials = Some(credentials.clone());
                    slot.failed_at = None;
                    slot.last_failure = None;
                    slot.fetches += 1;
                    self.set_state(TokenState::Valid);
                    return Ok(credentials);
                }
                Err(AuthError::Shutdown) => return Err(AuthError::Shutdown),
                Err(AuthError::Rejected(msg)) => {
                    last = msg;
                    rejected = true;
                    break;
                }
                Err(e) => {
                    last = e.to_string();
                    tracing::warn!(
                        connection = %self.name,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %e,
                        "Credential fetch failed"
                    );
                    if attempt < max_attempts {
                        let delay = self.settings.retry_delay * 2u32.pow(attempt - 1);
                        let slept = tokio::select! {
                            _ = tokio::time::sleep(delay) => true,
                            _ = self.stop.cancelled() => false,
                        };
                        if !slept {
                            return Err(AuthError::Shutdown);
                        }
                    }
                }
            }
        }

        tracing::error!(
            connection = %self.name,
            attempts = attempts,
            rejected = rejected,
            error = %last,
            "Credential refresh failed"
        );
        slot.credentials = None;
        slot.failed_at = Some(Instant::now());
        slot.last_failure = Some((last.clone(), rejected));
        self.set_state(TokenState::Failed);
        Err(AuthError::Failed {
            attempts,
            last,
            rejected,
        })
    }

    fn set_state(&self, state: TokenState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Hands out scripted results and counts calls.
    struct Scripted {
        results: StdMutex<VecDeque<Result<Credentials, AuthError>>>,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl CredentialSource for Scripted {
        fn mode(&self) -> &'static str {
            "scripted"
        }

        async fn fetch(&self) -> Result<Credentials, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AuthError::Unavailable("script exhausted".to_string())))
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn refresher(
        results: Vec<Result<Credentials, AuthError>>,
        settings: RefresherSettings,
    ) -> (Arc<TokenRefresher>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let source = Scripted {
            results: StdMutex::new(results.into()),
            calls: calls.clone(),
        };
        let refresher = TokenRefresher::new(
            "test",
            Box::new(source),
            settings,
            Arc::new(MockClock::starting_at(start())),
            CancellationToken::new(),
        );
        (Arc::new(refresher), calls)
    }

    fn token(value: &str, ttl_secs: i64) -> Credentials {
        Credentials::bearer(value, Some(start() + chrono::Duration::seconds(ttl_secs)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshes_only_when_stale() {
        let settings = RefresherSettings {
            safety_margin: Duration::ZERO,
            ..Default::default()
        };
        let (refresher, calls) = refresher(vec![Ok(token("A", 2)), Ok(token("B", 600))], settings);
        assert_eq!(refresher.status(), TokenState::Uninitialized);

        assert_eq!(refresher.credentials().await.unwrap().access_token, "A");
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(refresher.credentials().await.unwrap().access_token, "A");
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(refresher.credentials().await.unwrap().access_token, "B");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(refresher.status(), TokenState::Valid);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_on_arrival_is_a_failed_attempt() {
        let settings = RefresherSettings {
            max_attempts: 2,
            ..Default::default()
        };
        let (recovers, calls) = refresher(vec![Ok(token("dead", 0)), Ok(token("B", 600))], settings.clone());
        assert_eq!(recovers.credentials().await.unwrap().access_token, "B");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let (gives_up, calls) = refresher(vec![Ok(token("dead", 0)), Ok(token("dead", -5))], settings);
        let err = gives_up.credentials().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(gives_up.status(), TokenState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_reads_share_one_fetch() {
        let (refresher, calls) =
            refresher(vec![Ok(token("A", 3600))], RefresherSettings::default());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let r = refresher.clone();
            handles.push(tokio::spawn(async move { r.credentials().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().access_token, "A");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_skips_when_already_replaced() {
        let (refresher, calls) = refresher(
            vec![Ok(token("A", 3600)), Ok(token("B", 3600)), Ok(token("C", 3600))],
            RefresherSettings::default(),
        );
        let a = refresher.credentials().await.unwrap();

        let b = refresher.force_refresh(Some(&a)).await.unwrap();
        assert_eq!(b.access_token, "B");

        // A second caller that also saw "A" gets "B" without a fetch
        let again = refresher.force_refresh(Some(&a)).await.unwrap();
        assert_eq!(again.access_token, "B");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_then_cooldown_then_recovery() {
        let settings = RefresherSettings {
            max_attempts: 2,
            cooldown: Duration::from_secs(30),
            ..Default::default()
        };
        let (refresher, calls) = refresher(
            vec![
                Err(AuthError::Unavailable("503".to_string())),
                Err(AuthError::Unavailable("503".to_string())),
                Ok(token("A", 3600)),
            ],
            settings,
        );

        let err = refresher.credentials().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(refresher.status(), TokenState::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Within the cool-down nobody hits the endpoint
        assert!(refresher.credentials().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(refresher.credentials().await.unwrap().access_token, "A");
        assert_eq!(refresher.status(), TokenState::Valid);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let (refresher, calls) = refresher(
            vec![Err(AuthError::Rejected("invalid_client".to_string()))],
            RefresherSettings::default(),
        );
        let err = refresher.credentials().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_header_rendering() {
        let bearer = Credentials::bearer("abc", None);
        let (name, value) = bearer.header().unwrap();
        assert_eq!(name, AUTHORIZATION);
        assert_eq!(value.to_str().unwrap(), "Bearer abc");
        assert!(value.is_sensitive());

        let custom = Credentials {
            header_name: Some("X-Api-Key".to_string()),
            ..Credentials::bearer("k", None)
        };
        let (name, value) = custom.header().unwrap();
        assert_eq!(name.as_str(), "x-api-key");
        assert_eq!(value.to_str().unwrap(), "k");
    }

    #[test]
    fn test_debug_redacts_token() {
        let rendered = format!("{:?}", Credentials::bearer("secret-value", None));
        assert!(!rendered.contains("secret-value"));
    }
}
