use super::batch::{Batch, PendingBatches};
use super::intake::{IntakeSink, PushOutcome};
use super::{CommitHook, Envelope, QueueReceiver};
use crate::error::ConnectorError;
use crate::http::retry::{sleep_or_stop, RetryPolicy};
use crate::telemetry::{MetricLabels, SharedMetrics};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    pub chunk_size: usize,
    pub max_flush_age: Duration,
    /// Backoff between push attempts of the same batch
    pub retry: RetryPolicy,
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            max_flush_age: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForwarderStats {
    pub batches_pushed: u64,
    pub events_pushed: u64,
    pub events_dropped: u64,
    /// Events still unpushed when the forwarder stopped
    pub events_pending: u64,
    pub commits_run: u64,
}

/// Drains one queue into the intake, one batch per stream at a time.
///
/// A batch that keeps failing is retried in place; while that happens the
/// queue fills up and producers wait.
pub struct BatchForwarder {
    name: String,
    intake_key: String,
    settings: ForwarderSettings,
    queue: QueueReceiver,
    sink: Arc<dyn IntakeSink>,
    metrics: SharedMetrics,
    pending: PendingBatches,
    stats: ForwarderStats,
}

impl BatchForwarder {
    pub fn new(
        name: impl Into<String>,
        intake_key: impl Into<String>,
        settings: ForwarderSettings,
        queue: QueueReceiver,
        sink: Arc<dyn IntakeSink>,
        metrics: SharedMetrics,
    ) -> Self {
        let intake_key = intake_key.into();
        Self {
            name: name.into(),
            pending: PendingBatches::new(intake_key.clone()),
            intake_key,
            settings,
            queue,
            sink,
            metrics,
            stats: ForwarderStats::default(),
        }
    }

    /// Run until `stop` fires or every producer is gone, then flush what is left.
    pub async fn run(mut self, stop: CancellationToken) -> ForwarderStats {
        info!(
            forwarder = %self.name,
            chunk_size = self.settings.chunk_size,
            max_flush_age_ms = self.settings.max_flush_age.as_millis() as u64,
            "Forwarder started"
        );

        loop {
            let deadline = self.pending.next_deadline(self.settings.max_flush_age);
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    debug!(forwarder = %self.name, "Stop requested");
                    break;
                }
                received = self.queue.recv() => match received {
                    Some(envelope) => {
                        self.accept(envelope, &stop).await;
                        // A busy queue keeps this branch winning; quiet streams still age out
                        self.flush_expired(&stop).await;
                    }
                    None => {
                        debug!(forwarder = %self.name, "All producers gone");
                        break;
                    }
                },
                _ = until(deadline) => self.flush_expired(&stop).await,
            }
        }

        self.drain(&stop).await;
        info!(
            forwarder = %self.name,
            batches = self.stats.batches_pushed,
            events = self.stats.events_pushed,
            dropped = self.stats.events_dropped,
            pending = self.stats.events_pending,
            "Forwarder stopped"
        );
        self.stats
    }

    async fn flush_expired(&mut self, stop: &CancellationToken) {
        for batch in self.pending.take_expired(self.settings.max_flush_age) {
            self.flush(batch, stop).await;
        }
    }

    async fn accept(&mut self, envelope: Envelope, stop: &CancellationToken) {
        match envelope {
            Envelope::Event(event) => {
                if let Some(batch) = self.pending.push(event, self.settings.chunk_size) {
                    self.flush(batch, stop).await;
                }
            }
            Envelope::Commit(hook) => {
                if let Some(hook) = self.pending.attach_commit(hook) {
                    self.run_commits(vec![hook]).await;
                }
            }
        }
    }

    /// Push one batch. Retries until it goes through or the stop token fires;
    /// once stopping, a single attempt is made.
    async fn flush(&mut self, mut batch: Batch, stop: &CancellationToken) {
        let labels = MetricLabels::new(&self.intake_key, &batch.stream_key);
        let mut failures = 0u32;

        loop {
            let started = Instant::now();
            let result = self.sink.push(&batch).await;
            let elapsed = started.elapsed();

            match result {
                Ok(PushOutcome::Accepted) => {
                    let count = batch.len() as u64;
                    self.metrics.outgoing_events(&labels, count);
                    self.metrics.forward_duration(&labels, elapsed);
                    self.stats.batches_pushed += 1;
                    self.stats.events_pushed += count;
                    debug!(
                        forwarder = %self.name,
                        batch_id = %batch.batch_id,
                        stream_key = %batch.stream_key,
                        events = count,
                        duration_ms = elapsed.as_millis() as u64,
                        "Batch pushed"
                    );
                    self.run_commits(batch.take_commits()).await;
                    return;
                }
                Ok(PushOutcome::Rejected { status, body }) => {
                    error!(
                        forwarder = %self.name,
                        batch_id = %batch.batch_id,
                        stream_key = %batch.stream_key,
                        events = batch.len(),
                        status = status,
                        body = %body,
                        "Intake rejected batch, dropping it"
                    );
                    self.stats.events_dropped += batch.len() as u64;
                    self.run_commits(batch.take_commits()).await;
                    return;
                }
                Err(e) => {
                    failures += 1;
                    if stop.is_cancelled() {
                        self.abandon(&batch, &e);
                        return;
                    }
                    let delay = self.settings.retry.delay_for_retry(failures);
                    warn!(
                        forwarder = %self.name,
                        batch_id = %batch.batch_id,
                        stream_key = %batch.stream_key,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        kind = e.kind().label(),
                        error = %e,
                        "Batch push failed, retrying"
                    );
                    if !sleep_or_stop(delay, stop).await {
                        self.abandon(&batch, &e);
                        return;
                    }
                }
            }
        }
    }

    fn abandon(&mut self, batch: &Batch, last_error: &ConnectorError) {
        self.stats.events_pending += batch.len() as u64;
        error!(
            forwarder = %self.name,
            batch_id = %batch.batch_id,
            stream_key = %batch.stream_key,
            events = batch.len(),
            error = %last_error,
            "Batch left pending at shutdown; its checkpoint was not advanced"
        );
    }

    async fn run_commits(&mut self, hooks: Vec<CommitHook>) {
        for hook in hooks {
            let stream_key = hook.stream_key().to_string();
            let description = hook.description().to_string();
            match hook.run().await {
                Ok(()) => {
                    self.stats.commits_run += 1;
                    debug!(stream_key = %stream_key, commit = %description, "Commit applied");
                }
                Err(e) => warn!(
                    stream_key = %stream_key,
                    commit = %description,
                    kind = e.kind().label(),
                    error = %e,
                    "Commit failed, checkpoint unchanged"
                ),
            }
        }
    }

    async fn drain(&mut self, stop: &CancellationToken) {
        self.queue.close();
        while let Ok(envelope) = self.queue.try_recv() {
            self.accept(envelope, stop).await;
        }
        for batch in self.pending.take_all() {
            if !batch.is_empty() {
                self.flush(batch, stop).await;
            }
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
