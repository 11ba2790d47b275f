//! Metrics facade and logging setup.

use ::metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Label};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const INCOMING_EVENTS: &str = "incoming_events";
pub const OUTGOING_EVENTS: &str = "outgoing_events";
pub const EVENTS_LAG_SECONDS: &str = "events_lag_seconds";
pub const FETCH_DURATION_SECONDS: &str = "fetch_duration_seconds";
pub const FORWARD_DURATION_SECONDS: &str = "forward_duration_seconds";
pub const PARSE_ERRORS_TOTAL: &str = "parse_errors_total";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricLabels {
    pub intake_key: String,
    pub stream_key: String,
    /// Optional `type` label
    pub kind: Option<String>,
}

impl MetricLabels {
    pub fn new(intake_key: impl Into<String>, stream_key: impl Into<String>) -> Self {
        Self {
            intake_key: intake_key.into(),
            stream_key: stream_key.into(),
            kind: None,
        }
    }

    pub fn with_kind(&self, kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..self.clone()
        }
    }

    fn to_labels(&self) -> Vec<Label> {
        let mut labels = vec![
            Label::new("intake_key", self.intake_key.clone()),
            Label::new("stream_key", self.stream_key.clone()),
        ];
        if let Some(kind) = &self.kind {
            labels.push(Label::new("type", kind.clone()));
        }
        labels
    }
}

pub trait MetricsSink: Send + Sync + fmt::Debug {
    fn incoming_events(&self, labels: &MetricLabels, count: u64);
    fn outgoing_events(&self, labels: &MetricLabels, count: u64);
    fn events_lag(&self, labels: &MetricLabels, lag: Duration);
    fn fetch_duration(&self, labels: &MetricLabels, duration: Duration);
    fn forward_duration(&self, labels: &MetricLabels, duration: Duration);
    fn parse_errors(&self, labels: &MetricLabels, count: u64);
}

pub type SharedMetrics = Arc<dyn MetricsSink>;

/// Reports through the `metrics` facade to whatever recorder the host installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeMetrics;

impl FacadeMetrics {
    pub fn shared() -> SharedMetrics {
        describe_metrics();
        Arc::new(FacadeMetrics)
    }
}

fn describe_metrics() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        describe_counter!(INCOMING_EVENTS, "Events fetched from upstream after dedup.");
        describe_counter!(OUTGOING_EVENTS, "Events accepted by the intake.");
        describe_gauge!(
            EVENTS_LAG_SECONDS,
            "Age of the most recent event seen by a stream."
        );
        describe_histogram!(FETCH_DURATION_SECONDS, "Duration of one pull tick.");
        describe_histogram!(FORWARD_DURATION_SECONDS, "Duration of one intake push.");
        describe_counter!(PARSE_ERRORS_TOTAL, "Upstream events that could not be parsed.");
    });
}

impl MetricsSink for FacadeMetrics {
    fn incoming_events(&self, labels: &MetricLabels, count: u64) {
        counter!(INCOMING_EVENTS, labels.to_labels()).increment(count);
    }

    fn outgoing_events(&self, labels: &MetricLabels, count: u64) {
        counter!(OUTGOING_EVENTS, labels.to_labels()).increment(count);
    }

    fn events_lag(&self, labels: &MetricLabels, lag: Duration) {
        gauge!(EVENTS_LAG_SECONDS, labels.to_labels()).set(lag.as_secs_f64());
    }

    fn fetch_duration(&self, labels: &MetricLabels, duration: Duration) {
        histogram!(FETCH_DURATION_SECONDS, labels.to_labels()).record(duration.as_secs_f64());
    }

    fn forward_duration(&self, labels: &MetricLabels, duration: Duration) {
        histogram!(FORWARD_DURATION_SECONDS, labels.to_labels()).record(duration.as_secs_f64());
    }

    fn parse_errors(&self, labels: &MetricLabels, count: u64) {
        counter!(PARSE_ERRORS_TOTAL, labels.to_labels()).increment(count);
    }
}

/// Keeps every observation in memory. Used by tests and `--dry-run` style tooling.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    counters: Mutex<HashMap<(&'static str, MetricLabels), u64>>,
    gauges: Mutex<HashMap<(&'static str, MetricLabels), f64>>,
    histograms: Mutex<HashMap<(&'static str, MetricLabels), Vec<f64>>>,
}

impl RecordingMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn counter(&self, name: &'static str, labels: &MetricLabels) -> u64 {
        self.counters
            .lock()
            .ok()
            .and_then(|c| c.get(&(name, labels.clone())).copied())
            .unwrap_or(0)
    }

    /// Sum of a counter over every label set.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|c| c.iter().filter(|((n, _), _)| *n == name).map(|(_, v)| *v).sum())
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &'static str, labels: &MetricLabels) -> Option<f64> {
        self.gauges
            .lock()
            .ok()
            .and_then(|g| g.get(&(name, labels.clone())).copied())
    }

    pub fn observations(&self, name: &'static str, labels: &MetricLabels) -> Vec<f64> {
        self.histograms
            .lock()
            .ok()
            .and_then(|h| h.get(&(name, labels.clone())).cloned())
            .unwrap_or_default()
    }

    fn add(&self, name: &'static str, labels: &MetricLabels, count: u64) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry((name, labels.clone())).or_insert(0) += count;
        }
    }

    fn set(&self, name: &'static str, labels: &MetricLabels, value: f64) {
        if let Ok(mut gauges) = self.gauges.lock() {
            gauges.insert((name, labels.clone()), value);
        }
    }

    fn record(&self, name: &'static str, labels: &MetricLabels, value: f64) {
        if let Ok(mut histograms) = self.histograms.lock() {
            histograms.entry((name, labels.clone())).or_default().push(value);
        }
    }
}

impl MetricsSink for RecordingMetrics {
    fn incoming_events(&self, labels: &MetricLabels, count: u64) {
        self.add(INCOMING_EVENTS, labels, count);
    }

    fn outgoing_events(&self, labels: &MetricLabels, count: u64) {
        self.add(OUTGOING_EVENTS, labels, count);
    }

    fn events_lag(&self, labels: &MetricLabels, lag: Duration) {
        self.set(EVENTS_LAG_SECONDS, labels, lag.as_secs_f64());
    }

    fn fetch_duration(&self, labels: &MetricLabels, duration: Duration) {
        self.record(FETCH_DURATION_SECONDS, labels, duration.as_secs_f64());
    }

    fn forward_duration(&self, labels: &MetricLabels, duration: Duration) {
        self.record(FORWARD_DURATION_SECONDS, labels, duration.as_secs_f64());
    }

    fn parse_errors(&self, labels: &MetricLabels, count: u64) {
        self.add(PARSE_ERRORS_TOTAL, labels, count);
    }
}

const DEFAULT_DIRECTIVE: &str = "conveyor=info";

/// Filter directive from `LOG_LEVEL` (debug, info, warning, error), then
/// `RUST_LOG`, then `conveyor=info`.
pub fn log_directive(log_level: Option<&str>, rust_log: Option<&str>) -> String {
    let level = log_level.map(|l| l.trim().to_ascii_lowercase());
    match level.as_deref() {
        Some("warning") => "conveyor=warn".to_string(),
        Some(l @ ("trace" | "debug" | "info" | "warn" | "error")) => format!("conveyor={}", l),
        _ => rust_log
            .filter(|r| !r.trim().is_empty())
            .unwrap_or(DEFAULT_DIRECTIVE)
            .to_string(),
    }
}

/// Install the global tracing subscriber. Safe to call more than once.
pub fn init_logging() {
    let directive = log_directive(
        std::env::var("LOG_LEVEL").ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
