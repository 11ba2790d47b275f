//! Polled JSON API: one GET per page, events at a JSON pointer.

use super::Extractor;
use crate::clock::SharedClock;
use crate::config::types::{HttpJsonConfig, PaginationConfig};
use crate::error::ConnectorError;
use crate::http::HttpClient;
use crate::stepper::{StepperSettings, TimeStepper};
use crate::storage::CheckpointValue;
use crate::worker::{Page, PullSource};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct HttpJsonSource {
    stream_key: String,
    client: HttpClient,
    config: HttpJsonConfig,
    extractor: Extractor,
    frequency: Duration,
    lag: Duration,
    clock: SharedClock,
    /// Window mode only; rebuilt whenever the checkpoint disagrees with it
    stepper: Option<TimeStepper>,
}

impl HttpJsonSource {
    pub fn new(
        stream_key: &str,
        client: HttpClient,
        config: HttpJsonConfig,
        frequency: Duration,
        lag: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            stream_key: stream_key.to_string(),
            client,
            extractor: Extractor::new(config.extract.clone()),
            config,
            frequency,
            lag,
            clock,
            stepper: None,
        }
    }

    fn base_query(&self) -> Vec<(String, String)> {
        self.config
            .query
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    async fn get(&self, query: &[(String, String)]) -> Result<(Value, Vec<Value>), ConnectorError> {
        let body: Value = self.client.get_json(&self.config.url, query, None).await?;
        let items = items_at(&body, &self.config.items)?;
        Ok((body, items))
    }

    async fn fetch_single(&mut self) -> Result<Page, ConnectorError> {
        let (_, items) = self.get(&self.base_query()).await?;
        let (events, rejected) = self.extractor.extract_all(&self.stream_key, items);
        Ok(Page::new(events, None).with_rejected(rejected))
    }

    async fn fetch_cursor(
        &mut self,
        next: &str,
        param: &str,
        cursor: Option<&CheckpointValue>,
    ) -> Result<Page, ConnectorError> {
        // A timestamp left behind by a cursor-less first page restarts from the top
        let current = match cursor {
            Some(CheckpointValue::Cursor(c)) => Some(c.clone()),
            _ => None,
        };
        let mut query = self.base_query();
        if let Some(c) = &current {
            query.push((param.to_string(), c.clone()));
        }

        let (body, items) = self.get(&query).await?;
        let vendor_next = match body.pointer(next) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        // Never step past a position whose page came back empty
        let next_cursor = (if items.is_empty() { None } else { vendor_next })
            .or(current)
            .map(CheckpointValue::Cursor);

        let (events, rejected) = self.extractor.extract_all(&self.stream_key, items);
        Ok(Page::new(events, next_cursor).with_rejected(rejected))
    }

    async fn fetch_since(
        &mut self,
        param: &str,
        lookback: Duration,
        cursor: Option<&CheckpointValue>,
    ) -> Result<Page, ConnectorError> {
        let since = match cursor.and_then(CheckpointValue::as_timestamp) {
            Some(ts) => Some(ts),
            None if !lookback.is_zero() => {
                Some(crate::clock::earlier(self.clock.now(), lookback))
            }
            None => None,
        };
        let mut query = self.base_query();
        if let Some(since) = since {
            query.push((param.to_string(), format_time(since)));
        }

        let (_, items) = self.get(&query).await?;
        let (events, rejected) = self.extractor.extract_all(&self.stream_key, items);
        let next_cursor = events
            .iter()
            .map(|e| e.timestamp)
            .max()
            .map(|ts| CheckpointValue::Timestamp(ts + chrono::Duration::milliseconds(1)));
        Ok(Page::new(events, next_cursor).with_rejected(rejected))
    }

    async fn fetch_window(
        &mut self,
        start_param: &str,
        end_param: &str,
        start_time: Duration,
        horizon: Option<Duration>,
        cursor: Option<&CheckpointValue>,
    ) -> Result<Page, ConnectorError> {
        let resume = cursor.and_then(CheckpointValue::as_timestamp);
        let in_sync = match (&self.stepper, resume) {
            (Some(stepper), Some(ts)) => stepper.peek().start == ts,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !in_sync {
            let mut settings = StepperSettings::new(self.frequency, self.lag);
            settings.start_time = start_time;
            settings.horizon = horizon;
            // Window stepping here only polls try_next, so the stop token is never awaited
            let stepper = match resume {
                Some(ts) => TimeStepper::resume_from(ts, settings, self.clock.clone(), CancellationToken::new()),
                None => TimeStepper::new(settings, self.clock.clone(), CancellationToken::new()),
            };
            self.stepper = Some(stepper);
        }

        let Some(window) = self.stepper.as_mut().and_then(TimeStepper::try_next) else {
            debug!(stream_key = %self.stream_key, "Next window not closed yet");
            return Ok(Page::empty());
        };

        let mut query = self.base_query();
        query.push((start_param.to_string(), format_time(window.start)));
        query.push((end_param.to_string(), format_time(window.end)));
        let (_, items) = self.get(&query).await?;
        let (events, rejected) = self.extractor.extract_all(&self.stream_key, items);
        Ok(Page::new(events, Some(CheckpointValue::Timestamp(window.end))).with_rejected(rejected))
    }
}

#[async_trait]
impl PullSource for HttpJsonSource {
    async fn fetch(&mut self, cursor: Option<&CheckpointValue>) -> Result<Page, ConnectorError> {
        match self.config.pagination.clone() {
            PaginationConfig::Single => self.fetch_single().await,
            PaginationConfig::Cursor { next, param } => self.fetch_cursor(&next, &param, cursor).await,
            PaginationConfig::Since { param, lookback } => {
                self.fetch_since(&param, lookback, cursor).await
            }
            PaginationConfig::Window {
                start_param,
                end_param,
                start_time,
                horizon,
            } => {
                self.fetch_window(&start_param, &end_param, start_time, horizon, cursor)
                    .await
            }
        }
    }
}

fn format_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The array at `pointer`; an empty pointer means the body itself.
fn items_at(body: &Value, pointer: &str) -> Result<Vec<Value>, ConnectorError> {
    let target = if pointer.is_empty() {
        Some(body)
    } else {
        body.pointer(pointer)
    };
    match target {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(Value::Null) => Ok(Vec::new()),
        Some(other) => Err(ConnectorError::Parse(format!(
            "expected an array at '{}', found {}",
            pointer,
            type_name(other)
        ))),
        None => Err(ConnectorError::Parse(format!("no array at '{}'", pointer))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
