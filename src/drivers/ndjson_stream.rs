//! Long-lived HTTP response carrying one JSON event per line.

use super::Extractor;
use crate::config::types::NdjsonStreamConfig;
use crate::error::ConnectorError;
use crate::event::RejectedEvent;
use crate::http::{HttpClient, LineStream};
use crate::storage::CheckpointValue;
use crate::worker::{Page, Subscription};
use async_trait::async_trait;
use chrono::SecondsFormat;
use tracing::{debug, info};

pub struct NdjsonSubscription {
    stream_key: String,
    client: HttpClient,
    config: NdjsonStreamConfig,
    extractor: Extractor,
    lines: Option<LineStream>,
}

impl NdjsonSubscription {
    pub fn new(stream_key: &str, client: HttpClient, config: NdjsonStreamConfig) -> Self {
        Self {
            stream_key: stream_key.to_string(),
            client,
            extractor: Extractor::new(config.extract.clone()),
            config,
            lines: None,
        }
    }

    fn query(&self, resume: Option<&CheckpointValue>) -> Vec<(String, String)> {
        let mut query: Vec<(String, String)> = self
            .config
            .query
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let (Some(param), Some(position)) = (&self.config.resume_param, resume) {
            query.push((param.clone(), resume_value(position)));
        }
        query
    }

    fn parse_line(&self, line: &str) -> Page {
        match serde_json::from_str(line) {
            Ok(record) => match self.extractor.extract(&self.stream_key, record) {
                Ok(event) => Page::new(vec![event], None),
                Err(rejected) => Page::empty().with_rejected(vec![rejected]),
            },
            Err(e) => Page::empty().with_rejected(vec![RejectedEvent::new(
                None,
                format!("invalid JSON line: {}", e),
            )]),
        }
    }
}

/// How a stored position is sent back to the server.
fn resume_value(position: &CheckpointValue) -> String {
    match position {
        CheckpointValue::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::Millis, true),
        CheckpointValue::Cursor(c) => c.clone(),
        CheckpointValue::Offset(n) => n.to_string(),
    }
}

#[async_trait]
impl Subscription for NdjsonSubscription {
    async fn connect(&mut self, resume: Option<&CheckpointValue>) -> Result<(), ConnectorError> {
        self.lines = None;
        let query = self.query(resume);
        let lines = self.client.stream(&self.config.url, &query, None).await?;
        info!(
            stream_key = %self.stream_key,
            resume = %resume.map(|r| r.to_string()).unwrap_or_else(|| "none".to_string()),
            "Subscribed"
        );
        self.lines = Some(lines);
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<Page>, ConnectorError> {
        loop {
            let Some(lines) = self.lines.as_mut() else {
                return Ok(None);
            };
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!(stream_key = %self.stream_key, "Server closed the stream");
                    self.lines = None;
                    return Ok(None);
                }
                Err(e) => {
                    self.lines = None;
                    return Err(e.into());
                }
            };
            // Blank lines are keep-alives
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(self.parse_line(&line)));
        }
    }
}
