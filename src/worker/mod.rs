pub mod pull;
pub mod push;
pub mod state;

pub use pull::{PullSettings, PullSource, PullWorker};
pub use push::{PushSettings, PushWorker, Subscription};
pub use state::{DedupSettings, Page, PageStats, StreamState};

use crate::clock::SharedClock;
use crate::error::{ConnectorError, ErrorKind};
use crate::forwarder::{Envelope, QueueSender};
use crate::storage::CheckpointStore;
use crate::telemetry::{MetricLabels, SharedMetrics};
use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Everything a worker is handed by whoever starts it.
#[derive(Clone)]
pub struct WorkerContext {
    pub stream_key: String,
    pub intake_key: String,
    pub queue: QueueSender,
    pub store: CheckpointStore,
    pub metrics: SharedMetrics,
    pub clock: SharedClock,
}

impl WorkerContext {
    pub fn labels(&self) -> MetricLabels {
        MetricLabels::new(&self.intake_key, &self.stream_key)
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("stream_key", &self.stream_key)
            .field("intake_key", &self.intake_key)
            .finish()
    }
}

/// Put an envelope on the forwarder queue, waiting for room unless stopped.
pub async fn enqueue(
    queue: &QueueSender,
    envelope: Envelope,
    stop: &CancellationToken,
) -> Result<(), ConnectorError> {
    tokio::select! {
        sent = queue.send(envelope) => sent.map_err(|_| ConnectorError::Shutdown),
        _ = stop.cancelled() => Err(ConnectorError::Shutdown),
    }
}

#[async_trait]
pub trait Worker: Send {
    fn name(&self) -> &str;

    /// Run until `stop` fires or an unrecoverable error occurs.
    async fn run(&mut self, stop: CancellationToken) -> Result<(), ConnectorError>;
}

/// A stream is either polled or subscribed to.
pub enum StreamWorker {
    Pull(PullWorker),
    Push(PushWorker),
}

#[async_trait]
impl Worker for StreamWorker {
    fn name(&self) -> &str {
        match self {
            StreamWorker::Pull(w) => w.name(),
            StreamWorker::Push(w) => w.name(),
        }
    }

    async fn run(&mut self, stop: CancellationToken) -> Result<(), ConnectorError> {
        match self {
            StreamWorker::Pull(w) => w.run(stop).await,
            StreamWorker::Push(w) => w.run(stop).await,
        }
    }
}

/// How a worker task ended.
#[derive(Debug)]
pub enum WorkerOutcome {
    Completed,
    Failed(ConnectorError),
    Panicked(String),
}

impl WorkerOutcome {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            WorkerOutcome::Completed => None,
            WorkerOutcome::Failed(e) => Some(e.kind()),
            WorkerOutcome::Panicked(_) => Some(ErrorKind::Transient),
        }
    }
}

/// A running worker task with its own stop token.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    stop: CancellationToken,
    task: JoinHandle<Result<(), ConnectorError>>,
}

impl WorkerHandle {
    /// Spawn `worker`; it stops when `parent` or [`WorkerHandle::stop`] fires.
    pub fn spawn<W: Worker + 'static>(mut worker: W, parent: &CancellationToken) -> Self {
        let name = worker.name().to_string();
        let stop = parent.child_token();
        let token = stop.clone();
        let task = tokio::spawn(async move { worker.run(token).await });
        Self { name, stop, task }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn alive(&self) -> bool {
        !self.task.is_finished()
    }

    /// Collect the outcome of a finished task. `None` while it still runs.
    pub async fn outcome(&mut self) -> Option<WorkerOutcome> {
        if !self.task.is_finished() {
            return None;
        }
        Some(Self::outcome_of((&mut self.task).await))
    }

    /// Stop and wait up to `timeout`. A worker that does not return in time
    /// is aborted and reported as `None`.
    pub async fn join(self, timeout: Duration) -> Option<WorkerOutcome> {
        self.stop.cancel();
        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(result) => Some(Self::outcome_of(result)),
            Err(_) => {
                warn!(worker = %self.name, timeout_ms = timeout.as_millis() as u64, "Worker did not stop in time, abandoning it");
                task.abort();
                None
            }
        }
    }

    fn outcome_of(result: Result<Result<(), ConnectorError>, tokio::task::JoinError>) -> WorkerOutcome {
        match result {
            Ok(Ok(())) => WorkerOutcome::Completed,
            Ok(Err(e)) => WorkerOutcome::Failed(e),
            Err(e) if e.is_panic() => WorkerOutcome::Panicked(e.to_string()),
            Err(e) => WorkerOutcome::Panicked(format!("task cancelled: {}", e)),
        }
    }
}
