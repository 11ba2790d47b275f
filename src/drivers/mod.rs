//! Generic vendor drivers configured from YAML, and the glue that turns
//! configured streams into supervised workers.

pub mod connection;
pub mod http_json;
pub mod ndjson_stream;

pub use connection::build_client;
pub use http_json::HttpJsonSource;
pub use ndjson_stream::NdjsonSubscription;

use crate::aggregate::{AggregationDefinition, EventAggregator};
use crate::clock::SharedClock;
use crate::config::types::{Config, ExtractConfig, SourceConfig, StreamConfig, TimestampFormat};
use crate::error::ConnectorError;
use crate::event::{content_fingerprint, Event, RejectedEvent};
use crate::http::{HttpClient, RetryPolicy};
use crate::supervisor::StreamSpec;
use crate::worker::{PullSettings, PullWorker, PushSettings, PushWorker, StreamWorker, WorkerContext};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Epoch values above this are taken as milliseconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 100_000_000_000.0;

/// Reads timestamp and fingerprint out of a vendor record.
#[derive(Debug, Clone)]
pub struct Extractor {
    config: ExtractConfig,
}

impl Extractor {
    pub fn new(config: ExtractConfig) -> Self {
        Self { config }
    }

    pub fn extract(&self, stream_key: &str, record: Value) -> Result<Event, RejectedEvent> {
        let fingerprint = match &self.config.id {
            Some(pointer) => match record.pointer(pointer) {
                Some(Value::String(id)) => id.clone(),
                Some(Value::Null) | None => {
                    return Err(RejectedEvent::new(None, format!("missing id at '{}'", pointer)))
                }
                Some(other) => other.to_string(),
            },
            None => content_fingerprint(&record),
        };

        let raw = record.pointer(&self.config.timestamp).ok_or_else(|| {
            RejectedEvent::new(
                Some(fingerprint.clone()),
                format!("missing timestamp at '{}'", self.config.timestamp),
            )
        })?;
        let timestamp = parse_timestamp(raw, self.config.timestamp_format)
            .map_err(|reason| RejectedEvent::new(Some(fingerprint.clone()), reason))?;

        Ok(Event::new(stream_key, timestamp, fingerprint, record))
    }

    /// Split records into events and rejects, keeping their order.
    pub fn extract_all(&self, stream_key: &str, records: Vec<Value>) -> (Vec<Event>, Vec<RejectedEvent>) {
        let mut events = Vec::with_capacity(records.len());
        let mut rejected = Vec::new();
        for record in records {
            match self.extract(stream_key, record) {
                Ok(event) => events.push(event),
                Err(reject) => rejected.push(reject),
            }
        }
        (events, rejected)
    }
}

pub fn parse_timestamp(raw: &Value, format: TimestampFormat) -> Result<DateTime<Utc>, String> {
    match (format, raw) {
        (TimestampFormat::Rfc3339 | TimestampFormat::Auto, Value::String(s)) => {
            match DateTime::parse_from_rfc3339(s) {
                Ok(ts) => Ok(ts.with_timezone(&Utc)),
                Err(e) if format == TimestampFormat::Auto => s
                    .parse::<f64>()
                    .map_err(|_| format!("invalid timestamp '{}': {}", s, e))
                    .and_then(|n| from_epoch(n, guess_millis(n))),
                Err(e) => Err(format!("invalid timestamp '{}': {}", s, e)),
            }
        }
        (TimestampFormat::EpochSeconds | TimestampFormat::EpochMillis, Value::String(s)) => {
            let n: f64 = s
                .parse()
                .map_err(|_| format!("invalid epoch timestamp '{}'", s))?;
            from_epoch(n, format == TimestampFormat::EpochMillis)
        }
        (TimestampFormat::Rfc3339, other) => Err(format!("expected an RFC 3339 string, got {}", other)),
        (_, Value::Number(n)) => {
            let n = n.as_f64().ok_or_else(|| format!("invalid epoch timestamp {}", n))?;
            let millis = match format {
                TimestampFormat::EpochMillis => true,
                TimestampFormat::EpochSeconds => false,
                _ => guess_millis(n),
            };
            from_epoch(n, millis)
        }
        (_, other) => Err(format!("unsupported timestamp value {}", other)),
    }
}

fn guess_millis(n: f64) -> bool {
    n.abs() >= EPOCH_MILLIS_THRESHOLD
}

fn from_epoch(n: f64, millis: bool) -> Result<DateTime<Utc>, String> {
    let ms = if millis { n } else { n * 1000.0 };
    Utc.timestamp_millis_opt(ms.round() as i64)
        .single()
        .ok_or_else(|| format!("epoch timestamp {} out of range", n))
}

/// Turn every enabled stream into one supervised slot.
pub fn stream_specs(
    config: &Config,
    clients: &BTreeMap<String, HttpClient>,
    clock: SharedClock,
) -> Vec<StreamSpec> {
    let mut specs = Vec::new();
    for (name, stream) in &config.streams {
        if !stream.enabled {
            info!(stream_key = %name, "Stream disabled, skipping");
            continue;
        }
        let intake_key = stream
            .intake_key
            .clone()
            .unwrap_or_else(|| config.intake.key.clone());
        let definitions: Vec<AggregationDefinition> = stream
            .aggregation
            .as_ref()
            .and_then(|dialect| config.aggregations.get(dialect))
            .map(|defs| defs.iter().map(AggregationDefinition::from_config).collect())
            .unwrap_or_default();
        let client = clients.get(&stream.connection).cloned();

        let factory = worker_factory(
            name.clone(),
            stream.clone(),
            client,
            definitions,
            clock.clone(),
        );
        specs.push(StreamSpec::new(name.clone(), intake_key, factory));
    }
    specs
}

fn worker_factory(
    name: String,
    stream: StreamConfig,
    client: Option<HttpClient>,
    definitions: Vec<AggregationDefinition>,
    clock: SharedClock,
) -> impl Fn(WorkerContext) -> Result<StreamWorker, ConnectorError> + Send + Sync + 'static {
    move |ctx| {
        let client = client.clone().ok_or_else(|| {
            ConnectorError::Config(format!(
                "stream '{}' references unknown connection '{}'",
                name, stream.connection
            ))
        })?;
        let aggregator = (!definitions.is_empty())
            .then(|| Arc::new(EventAggregator::new(definitions.clone(), clock.clone())));

        let worker = match &stream.source {
            SourceConfig::HttpJson(source) => {
                let driver = HttpJsonSource::new(
                    &name,
                    client,
                    source.clone(),
                    stream.frequency,
                    stream.lag,
                    clock.clone(),
                );
                let mut settings = PullSettings::new(stream.frequency);
                settings.dedup = stream.dedup.clone();
                let worker = PullWorker::new(ctx, settings, Box::new(driver));
                StreamWorker::Pull(match aggregator {
                    Some(aggregator) => worker.with_aggregator(aggregator),
                    None => worker,
                })
            }
            SourceConfig::NdjsonStream(source) => {
                let mut reconnect = RetryPolicy::new(0, source.reconnect_base);
                reconnect.max_delay = source.reconnect_max;
                let settings = PushSettings {
                    reconnect,
                    dedup: stream.dedup.clone(),
                    commit_interval: source.commit_interval,
                    ..Default::default()
                };
                let driver = NdjsonSubscription::new(&name, client, source.clone());
                let worker = PushWorker::new(ctx, settings, Box::new(driver));
                StreamWorker::Push(match aggregator {
                    Some(aggregator) => worker.with_aggregator(aggregator),
                    None => worker,
                })
            }
        };
        Ok(worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extractor(id: Option<&str>, format: TimestampFormat) -> Extractor {
        Extractor::new(ExtractConfig {
            timestamp: "/ts".to_string(),
            timestamp_format: format,
            id: id.map(str::to_string),
        })
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_timestamp_formats() {
        let auto = TimestampFormat::Auto;
        assert_eq!(
            parse_timestamp(&json!("2024-01-01T12:00:00Z"), auto).unwrap(),
            at(1_704_110_400)
        );
        assert_eq!(parse_timestamp(&json!(1_704_110_400), auto).unwrap(), at(1_704_110_400));
        assert_eq!(parse_timestamp(&json!(1_704_110_400_000i64), auto).unwrap(), at(1_704_110_400));
        assert_eq!(parse_timestamp(&json!("1704110400"), auto).unwrap(), at(1_704_110_400));
        assert_eq!(
            parse_timestamp(&json!(1_704_110_400_000i64), TimestampFormat::EpochMillis).unwrap(),
            at(1_704_110_400)
        );
        assert!(parse_timestamp(&json!(1_704_110_400), TimestampFormat::Rfc3339).is_err());
        assert!(parse_timestamp(&json!("yesterday"), auto).is_err());
        assert!(parse_timestamp(&json!(null), auto).is_err());
    }

    #[test]
    fn test_vendor_id_becomes_fingerprint() {
        let e = extractor(Some("/uuid"), TimestampFormat::Auto)
            .extract("s", json!({"uuid": "abc", "ts": "2024-01-01T12:00:00Z"}))
            .unwrap();
        assert_eq!(e.fingerprint, "abc");
        assert_eq!(e.stream_key, "s");

        let numeric = extractor(Some("/id"), TimestampFormat::Auto)
            .extract("s", json!({"id": 42, "ts": 1_704_110_400}))
            .unwrap();
        assert_eq!(numeric.fingerprint, "42");
    }

    #[test]
    fn test_content_hash_without_id() {
        let ex = extractor(None, TimestampFormat::Auto);
        let a = ex.extract("s", json!({"ts": 1, "b": 2, "a": 1})).unwrap();
        let b = ex.extract("s", json!({"a": 1, "ts": 1, "b": 2})).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.fingerprint.len(), 64);
    }

    #[test]
    fn test_bad_records_are_rejected_in_place() {
        let ex = extractor(Some("/id"), TimestampFormat::Auto);
        let (events, rejected) = ex.extract_all(
            "s",
            vec![
                json!({"id": "1", "ts": 10}),
                json!({"id": "2"}),
                json!({"ts": 12}),
                json!({"id": "4", "ts": 13}),
            ],
        );
        let ids: Vec<&str> = events.iter().map(|e| e.fingerprint.as_str()).collect();
        assert_eq!(ids, vec!["1", "4"]);
        assert_eq!(rejected.len(), 2);
        assert_eq!(rejected[0].fingerprint.as_deref(), Some("2"));
        assert!(rejected[1].fingerprint.is_none());
    }
}
