use crate::http::RateLimit;
use crate::worker::DedupSettings;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding `context.json`
    pub data_dir: PathBuf,
    pub intake: IntakeConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionConfig>,
    /// Dialect id -> aggregation definitions
    #[serde(default)]
    pub aggregations: BTreeMap<String, Vec<AggregationConfig>>,
    pub streams: BTreeMap<String, StreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    pub server: String,
    pub key: String,
    #[serde(default = "default_intake_path")]
    pub path: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_flush_age", with = "humantime_serde")]
    pub max_flush_age: Duration,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_intake_path() -> String {
    "/batch".to_string()
}

fn default_chunk_size() -> usize {
    10_000
}

fn default_flush_age() -> Duration {
    Duration::from_secs(5)
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_retries() -> u32 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub queue_size: usize,
    pub nb_forwarders: usize,
    /// Consumers per push stream; unpartitioned push drivers accept only 1
    pub nb_consumers: usize,
    #[serde(with = "humantime_serde")]
    pub supervise_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub consumer_join_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub forwarder_join_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub restart_cooldown: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            nb_forwarders: 1,
            nb_consumers: 1,
            supervise_interval: Duration::from_secs(5),
            consumer_join_timeout: Duration::from_secs(2),
            forwarder_join_timeout: Duration::from_secs(5),
            restart_cooldown: Duration::from_secs(5),
        }
    }
}

/// A named HTTP profile shared by the streams that reference it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    /// URL path prefix -> limit, applied on top of `rate_limit`
    #[serde(default)]
    pub endpoint_rate_limits: BTreeMap<String, RateLimit>,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_backoff_base() -> Duration {
    Duration::from_secs(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthConfig {
    ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default)]
        scope: Option<String>,
        #[serde(default = "default_safety_margin", with = "humantime_serde")]
        safety_margin: Duration,
    },
    RefreshToken {
        token_url: String,
        client_id: String,
        #[serde(default)]
        client_secret: Option<String>,
        refresh_token: String,
        #[serde(default = "default_safety_margin", with = "humantime_serde")]
        safety_margin: Duration,
    },
    ApiKey {
        key: String,
        /// Header carrying the key; `Authorization` when unset
        #[serde(default)]
        header: Option<String>,
        /// Prefix such as `SSWS` or `Token`
        #[serde(default)]
        scheme: Option<String>,
    },
}

fn default_safety_margin() -> Duration {
    Duration::from_secs(60)
}

impl AuthConfig {
    pub fn mode(&self) -> &'static str {
        match self {
            AuthConfig::ClientCredentials { .. } => "client_credentials",
            AuthConfig::RefreshToken { .. } => "refresh_token",
            AuthConfig::ApiKey { .. } => "api_key",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationConfig {
    pub name: String,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// JSON pointer -> value the event must hold
    #[serde(default)]
    pub condition: BTreeMap<String, Value>,
    /// JSON pointers whose values make up the fingerprint
    pub fingerprint: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Overrides `intake.key` for this stream
    #[serde(default)]
    pub intake_key: Option<String>,
    pub connection: String,
    #[serde(default = "default_frequency", with = "humantime_serde")]
    pub frequency: Duration,
    #[serde(default, with = "humantime_serde")]
    pub lag: Duration,
    #[serde(default)]
    pub dedup: Option<DedupSettings>,
    /// Aggregation dialect id
    #[serde(default)]
    pub aggregation: Option<String>,
    pub source: SourceConfig,
}

fn default_enabled() -> bool {
    true
}

fn default_frequency() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum SourceConfig {
    HttpJson(HttpJsonConfig),
    NdjsonStream(NdjsonStreamConfig),
}

impl SourceConfig {
    pub fn driver(&self) -> &'static str {
        match self {
            SourceConfig::HttpJson(_) => "http_json",
            SourceConfig::NdjsonStream(_) => "ndjson_stream",
        }
    }

    pub fn is_push(&self) -> bool {
        matches!(self, SourceConfig::NdjsonStream(_))
    }
}

/// How event metadata is read from a vendor record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractConfig {
    /// JSON pointer to the event timestamp
    pub timestamp: String,
    #[serde(default)]
    pub timestamp_format: TimestampFormat,
    /// JSON pointer to a vendor id; the content hash is used when absent
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    /// RFC 3339 string, or epoch seconds/millis guessed from magnitude
    #[default]
    Auto,
    Rfc3339,
    EpochSeconds,
    EpochMillis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpJsonConfig {
    pub url: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// JSON pointer to the event array; empty means the body is the array
    #[serde(default)]
    pub items: String,
    #[serde(flatten)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub pagination: PaginationConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PaginationConfig {
    /// One request per tick
    #[default]
    Single,
    Cursor {
        /// JSON pointer to the next-page cursor in the response
        next: String,
        /// Query parameter carrying the cursor
        param: String,
    },
    Since {
        /// Query parameter carrying the oldest timestamp wanted
        param: String,
        /// How far back the first request reaches
        #[serde(default, with = "humantime_serde")]
        lookback: Duration,
    },
    Window {
        start_param: String,
        end_param: String,
        /// How far back the first window starts; zero means "now minus lag"
        #[serde(default, with = "humantime_serde")]
        start_time: Duration,
        /// Oldest data the vendor retains
        #[serde(default, with = "humantime_serde")]
        horizon: Option<Duration>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NdjsonStreamConfig {
    pub url: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extract: ExtractConfig,
    /// Query parameter carrying the resume position on reconnect
    #[serde(default)]
    pub resume_param: Option<String>,
    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub reconnect_base: Duration,
    #[serde(default = "default_reconnect_max", with = "humantime_serde")]
    pub reconnect_max: Duration,
    #[serde(default = "default_commit_interval", with = "humantime_serde")]
    pub commit_interval: Duration,
}

fn default_reconnect_max() -> Duration {
    Duration::from_secs(60)
}

fn default_commit_interval() -> Duration {
    Duration::from_secs(5)
}
