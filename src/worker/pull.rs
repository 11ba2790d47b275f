use super::state::{DedupSettings, Page, PageStats, StreamState};
use super::{Worker, WorkerContext};
use crate::aggregate::EventAggregator;
use crate::error::{ConnectorError, ErrorKind};
use crate::http::paginate::{PageFetcher, Paginator};
use crate::http::retry::sleep_or_stop;
use crate::storage::CheckpointValue;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long the exit commit may wait for room on the queue.
const EXIT_COMMIT_TIMEOUT: Duration = Duration::from_secs(1);

/// A polled upstream API. One call returns one page.
#[async_trait]
pub trait PullSource: Send {
    /// Fetch the page at `cursor`, or the first page when `None`.
    ///
    /// `Page::next_cursor` of `None` ends the tick.
    async fn fetch(&mut self, cursor: Option<&CheckpointValue>) -> Result<Page, ConnectorError>;
}

/// Lets the paginator drive a [`PullSource`].
struct SourcePages<'a> {
    source: &'a mut dyn PullSource,
}

#[async_trait]
impl<'a> PageFetcher for SourcePages<'a> {
    type Cursor = CheckpointValue;
    type Page = Page;

    async fn fetch(&mut self, cursor: Option<&CheckpointValue>) -> Result<Page, ConnectorError> {
        self.source.fetch(cursor).await
    }

    fn next_cursor(&self, page: &Page) -> Option<CheckpointValue> {
        page.next_cursor.clone()
    }
}

#[derive(Debug, Clone)]
pub struct PullSettings {
    /// Target interval between tick starts
    pub frequency: Duration,
    pub dedup: Option<DedupSettings>,
    /// How often expired aggregation buckets are scanned
    pub aggregation_scan: Duration,
}

impl PullSettings {
    pub fn new(frequency: Duration) -> Self {
        Self {
            frequency,
            dedup: None,
            aggregation_scan: Duration::from_secs(1),
        }
    }

    pub fn with_dedup(mut self, dedup: DedupSettings) -> Self {
        self.dedup = Some(dedup);
        self
    }
}

/// Polls a source every `frequency`, following pagination until exhausted.
pub struct PullWorker {
    ctx: WorkerContext,
    settings: PullSettings,
    source: Box<dyn PullSource>,
    aggregator: Option<Arc<EventAggregator>>,
}

impl PullWorker {
    pub fn new(ctx: WorkerContext, settings: PullSettings, source: Box<dyn PullSource>) -> Self {
        Self {
            ctx,
            settings,
            source,
            aggregator: None,
        }
    }

    pub fn with_aggregator(mut self, aggregator: Arc<EventAggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    async fn tick(
        ctx: &WorkerContext,
        source: &mut dyn PullSource,
        state: &mut StreamState,
        stop: &CancellationToken,
    ) -> Result<PageStats, ConnectorError> {
        let start = state.checkpoint().cloned();
        let mut pages = Paginator::new(SourcePages { source }, start, stop.clone());
        let mut stats = PageStats::default();
        while let Some(page) = pages.next_page().await {
            let page = page?;
            stats.absorb(state.process_page(page, ctx, stop).await?);
            state.commit(ctx, stop).await?;
        }
        if stop.is_cancelled() {
            return Err(ConnectorError::Shutdown);
        }
        Ok(stats)
    }

    async fn run_ticks(
        &mut self,
        state: &mut StreamState,
        stop: &CancellationToken,
    ) -> Result<(), ConnectorError> {
        let labels = self.ctx.labels();
        loop {
            let tick_start = Instant::now();
            let result = Self::tick(&self.ctx, self.source.as_mut(), state, stop).await;
            let duration = tick_start.elapsed();
            self.ctx.metrics.fetch_duration(&labels, duration);

            match result {
                Ok(stats) => {
                    debug!(
                        stream_key = %self.ctx.stream_key,
                        received = stats.received,
                        forwarded = stats.forwarded,
                        duplicates = stats.duplicates,
                        duration_ms = duration.as_millis() as u64,
                        "Tick complete"
                    );
                }
                Err(e) => match e.kind() {
                    ErrorKind::Shutdown => return Ok(()),
                    ErrorKind::Auth | ErrorKind::Config => {
                        error!(
                            stream_key = %self.ctx.stream_key,
                            kind = e.kind().label(),
                            error = %e,
                            "Stopping worker"
                        );
                        return Err(e);
                    }
                    kind => {
                        warn!(
                            stream_key = %self.ctx.stream_key,
                            kind = kind.label(),
                            checkpoint = %state.checkpoint().map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()),
                            error = %e,
                            "Tick failed, retrying next tick"
                        );
                    }
                },
            }

            if duration < self.settings.frequency {
                if !sleep_or_stop(self.settings.frequency - duration, stop).await {
                    return Ok(());
                }
            } else {
                debug!(
                    stream_key = %self.ctx.stream_key,
                    duration_ms = duration.as_millis() as u64,
                    "Tick overran frequency, starting next tick immediately"
                );
                if stop.is_cancelled() {
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait]
impl Worker for PullWorker {
    fn name(&self) -> &str {
        &self.ctx.stream_key
    }

    async fn run(&mut self, stop: CancellationToken) -> Result<(), ConnectorError> {
        info!(
            stream_key = %self.ctx.stream_key,
            intake_key = %self.ctx.intake_key,
            frequency_s = self.settings.frequency.as_secs(),
            "Pull worker starting"
        );
        let mut state =
            StreamState::load(&self.ctx, self.settings.dedup.as_ref(), self.aggregator.clone()).await;

        let flusher_stop = stop.child_token();
        let flusher = self.aggregator.clone().map(|aggregator| {
            tokio::spawn(aggregator.run_flusher(
                self.settings.aggregation_scan,
                self.ctx.queue.clone(),
                flusher_stop.clone(),
            ))
        });

        let result = self.run_ticks(&mut state, &stop).await;

        flusher_stop.cancel();
        if let Some(flusher) = flusher {
            let _ = flusher.await;
        }
        state.commit_on_exit(&self.ctx, EXIT_COMMIT_TIMEOUT).await;
        info!(stream_key = %self.ctx.stream_key, "Pull worker stopped");
        result
    }
}
