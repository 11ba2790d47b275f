use super::state::{DedupSettings, Page, StreamState};
use super::{Worker, WorkerContext};
use crate::aggregate::EventAggregator;
use crate::error::{ConnectorError, ErrorKind};
use crate::http::retry::{sleep_or_stop, RetryPolicy};
use crate::storage::CheckpointValue;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EXIT_COMMIT_TIMEOUT: Duration = Duration::from_secs(1);

/// A streaming upstream: websocket, long-poll or chunked HTTP.
#[async_trait]
pub trait Subscription: Send {
    /// Open (or reopen) the connection, resuming after `resume` when the
    /// upstream supports it.
    async fn connect(&mut self, resume: Option<&CheckpointValue>) -> Result<(), ConnectorError>;

    /// Next message. `Ok(None)` means the upstream closed the connection.
    async fn next_message(&mut self) -> Result<Option<Page>, ConnectorError>;
}

#[derive(Debug, Clone)]
pub struct PushSettings {
    /// Backoff between reconnects. `max_retries` is ignored; push streams
    /// reconnect until stopped.
    pub reconnect: RetryPolicy,
    pub dedup: Option<DedupSettings>,
    /// Minimum spacing between checkpoint commits
    pub commit_interval: Duration,
    pub aggregation_scan: Duration,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            reconnect: RetryPolicy::default(),
            dedup: None,
            commit_interval: Duration::from_secs(5),
            aggregation_scan: Duration::from_secs(1),
        }
    }
}

pub struct PushWorker {
    name: String,
    ctx: WorkerContext,
    settings: PushSettings,
    subscription: Box<dyn Subscription>,
    aggregator: Option<Arc<EventAggregator>>,
}

enum Disconnect {
    /// Upstream closed or failed; reconnect after backoff
    Lost,
    Stopped,
}

impl PushWorker {
    pub fn new(ctx: WorkerContext, settings: PushSettings, subscription: Box<dyn Subscription>) -> Self {
        Self {
            name: ctx.stream_key.clone(),
            ctx,
            settings,
            subscription,
            aggregator: None,
        }
    }

    pub fn with_aggregator(mut self, aggregator: Arc<EventAggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    fn is_fatal(kind: ErrorKind) -> bool {
        matches!(kind, ErrorKind::Auth | ErrorKind::Config)
    }

    /// Read messages until the connection drops or the worker is stopped.
    /// Resets `failures` once a message arrives.
    async fn consume(
        &mut self,
        state: &mut StreamState,
        failures: &mut u32,
        stop: &CancellationToken,
    ) -> Result<Disconnect, ConnectorError> {
        let mut last_commit = Instant::now();
        loop {
            let message = tokio::select! {
                message = self.subscription.next_message() => message,
                _ = stop.cancelled() => return Ok(Disconnect::Stopped),
            };
            let page = match message {
                Ok(Some(page)) => page,
                Ok(None) => {
                    info!(worker = %self.name, "Upstream closed the stream");
                    return Ok(Disconnect::Lost);
                }
                Err(e) if Self::is_fatal(e.kind()) => return Err(e),
                Err(e) => {
                    warn!(
                        worker = %self.name,
                        kind = e.kind().label(),
                        error = %e,
                        "Stream read failed"
                    );
                    return Ok(Disconnect::Lost);
                }
            };
            *failures = 0;

            match state.process_page(page, &self.ctx, stop).await {
                Ok(stats) => {
                    debug!(worker = %self.name, forwarded = stats.forwarded, "Message processed");
                }
                Err(e) if e.kind() == ErrorKind::Shutdown => return Ok(Disconnect::Stopped),
                Err(e) => return Err(e),
            }

            if last_commit.elapsed() >= self.settings.commit_interval {
                match state.commit(&self.ctx, stop).await {
                    Ok(()) => last_commit = Instant::now(),
                    Err(e) if e.kind() == ErrorKind::Shutdown => return Ok(Disconnect::Stopped),
                    Err(e) => return Err(e),
                }
            }
        }
    }

    async fn run_connections(
        &mut self,
        state: &mut StreamState,
        stop: &CancellationToken,
    ) -> Result<(), ConnectorError> {
        let mut failures: u32 = 0;
        loop {
            let resume = state.checkpoint().cloned();
            let connected = tokio::select! {
                connected = self.subscription.connect(resume.as_ref()) => connected,
                _ = stop.cancelled() => return Ok(()),
            };

            match connected {
                Ok(()) => {
                    info!(
                        worker = %self.name,
                        resume = %resume.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()),
                        "Connected"
                    );
                    match self.consume(state, &mut failures, stop).await? {
                        Disconnect::Stopped => return Ok(()),
                        Disconnect::Lost => {}
                    }
                }
                Err(e) if e.kind() == ErrorKind::Shutdown => return Ok(()),
                Err(e) if Self::is_fatal(e.kind()) => return Err(e),
                Err(e) => {
                    warn!(
                        worker = %self.name,
                        kind = e.kind().label(),
                        error = %e,
                        "Connect failed"
                    );
                }
            }

            failures += 1;
            let delay = self.settings.reconnect.delay_for_retry(failures);
            debug!(
                worker = %self.name,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting after backoff"
            );
            if !sleep_or_stop(delay, stop).await {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl Worker for PushWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&mut self, stop: CancellationToken) -> Result<(), ConnectorError> {
        info!(
            worker = %self.name,
            stream_key = %self.ctx.stream_key,
            intake_key = %self.ctx.intake_key,
            "Push worker starting"
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

        let result = self.run_connections(&mut state, &stop).await;
        if let Err(e) = &result {
            error!(worker = %self.name, kind = e.kind().label(), error = %e, "Stopping worker");
        }

        flusher_stop.cancel();
        if let Some(flusher) = flusher {
            let _ = flusher.await;
        }
        state.commit_on_exit(&self.ctx, EXIT_COMMIT_TIMEOUT).await;
        info!(worker = %self.name, "Push worker stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{MockClock, SharedClock};
    use crate::event::Event;
    use crate::forwarder::{create_queue, Envelope, QueueReceiver};
    use crate::storage::CheckpointStore;
    use crate::telemetry::RecordingMetrics;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Step {
        ConnectFails,
        Message(Page),
        Close,
        Fatal,
    }

    /// Walks a script of connection events; idles forever once exhausted.
    struct Scripted {
        steps: VecDeque<Step>,
        connects: Arc<Mutex<Vec<(Instant, Option<CheckpointValue>)>>>,
    }

    #[async_trait]
    impl Subscription for Scripted {
        async fn connect(&mut self, resume: Option<&CheckpointValue>) -> Result<(), ConnectorError> {
            self.connects.lock().unwrap().push((Instant::now(), resume.cloned()));
            if matches!(self.steps.front(), Some(Step::ConnectFails)) {
                self.steps.pop_front();
                return Err(ConnectorError::Transient("connection refused".to_string()));
            }
            Ok(())
        }

        async fn next_message(&mut self) -> Result<Option<Page>, ConnectorError> {
            match self.steps.pop_front() {
                Some(Step::Message(page)) => Ok(Some(page)),
                Some(Step::Close) => Ok(None),
                Some(Step::Fatal) => Err(ConnectorError::Auth("subscription revoked".to_string())),
                Some(Step::ConnectFails) => Ok(None),
                None => std::future::pending().await,
            }
        }
    }

    fn event(fp: &str, minute: u32) -> Event {
        Event::new(
            "s",
            Utc.with_ymd_and_hms(2024, 1, 1, 11, minute, 0).unwrap(),
            fp,
            json!({ "id": fp }),
        )
    }

    async fn context(dir: &tempfile::TempDir) -> (WorkerContext, QueueReceiver) {
        let store = CheckpointStore::open(dir.path()).await.unwrap();
        let (tx, rx) = create_queue(100);
        let clock: SharedClock = Arc::new(MockClock::starting_at(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let ctx = WorkerContext {
            stream_key: "s".to_string(),
            intake_key: "key".to_string(),
            queue: tx,
            store,
            metrics: RecordingMetrics::new(),
            clock,
        };
        (ctx, rx)
    }

    fn settings() -> PushSettings {
        PushSettings {
            reconnect: RetryPolicy::new(0, Duration::from_secs(1)),
            commit_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_with_backoff_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut rx) = context(&dir).await;
        let connects = Arc::new(Mutex::new(Vec::new()));
        let subscription = Scripted {
            steps: VecDeque::from(vec![
                Step::Message(Page::new(vec![event("a", 1)], None)),
                Step::Close,
                Step::ConnectFails,
                Step::ConnectFails,
                Step::Message(Page::new(vec![event("b", 2)], None)),
            ]),
            connects: connects.clone(),
        };
        let mut worker = PushWorker::new(ctx, settings(), Box::new(subscription));
        assert_eq!(worker.name(), "s");

        let stop = CancellationToken::new();
        let task = {
            let stop = stop.clone();
            tokio::spawn(async move { worker.run(stop).await })
        };
        tokio::time::sleep(Duration::from_secs(30)).await;
        stop.cancel();
        task.await.unwrap().unwrap();

        let connects = connects.lock().unwrap();
        assert_eq!(connects.len(), 4);
        let gaps: Vec<Duration> = connects.windows(2).map(|w| w[1].0 - w[0].0).collect();
        // Reset after a message, then 1s, 2s, 4s
        assert_eq!(gaps, vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]);
        // Reconnects resume just past the newest event seen
        let resume = connects[1].1.as_ref().and_then(|c| c.as_timestamp()).unwrap();
        assert_eq!(
            resume,
            Utc.with_ymd_and_hms(2024, 1, 1, 11, 1, 0).unwrap() + chrono::Duration::milliseconds(1)
        );

        let mut events = Vec::new();
        let mut commits = 0;
        while let Ok(envelope) = rx.try_recv() {
            match envelope {
                Envelope::Event(e) => events.push(e.fingerprint),
                Envelope::Commit(_) => commits += 1,
            }
        }
        assert_eq!(events, vec!["a", "b"]);
        assert_eq!(commits, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commits_are_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut rx) = context(&dir).await;
        let subscription = Scripted {
            steps: VecDeque::from(vec![
                Step::Message(Page::new(vec![event("a", 1)], None)),
                Step::Message(Page::new(vec![event("b", 2)], None)),
                Step::Message(Page::new(vec![event("c", 3)], None)),
            ]),
            connects: Arc::new(Mutex::new(Vec::new())),
        };
        let settings = PushSettings {
            commit_interval: Duration::from_secs(60),
            ..settings()
        };
        let mut worker = PushWorker::new(ctx, settings, Box::new(subscription));
        let stop = CancellationToken::new();
        let task = {
            let stop = stop.clone();
            tokio::spawn(async move { worker.run(stop).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        stop.cancel();
        task.await.unwrap().unwrap();

        let mut descriptions = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            if let Envelope::Commit(hook) = envelope {
                descriptions.push(hook.description().to_string());
            }
        }
        // Only the exit commit, carrying the newest position
        assert_eq!(descriptions.len(), 1);
        assert!(descriptions[0].contains("11:03:00.001"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_stops_worker() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _rx) = context(&dir).await;
        let subscription = Scripted {
            steps: VecDeque::from(vec![Step::Fatal]),
            connects: Arc::new(Mutex::new(Vec::new())),
        };
        let mut worker = PushWorker::new(ctx, settings(), Box::new(subscription));
        let err = worker.run(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
    }
}
