pub mod batch;
pub mod intake;
pub mod runner;

pub use batch::{Batch, IntakePayload, PendingBatches};
pub use intake::{IntakeClient, IntakeSink, PushOutcome};
pub use runner::{BatchForwarder, ForwarderSettings, ForwarderStats};

use crate::error::ConnectorError;
use crate::event::Event;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;

pub type QueueSender = mpsc::Sender<Envelope>;
pub type QueueReceiver = mpsc::Receiver<Envelope>;

/// Create a bounded forwarder queue. Producers wait when it is full.
pub fn create_queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Item travelling from a worker to its forwarder.
#[derive(Debug)]
pub enum Envelope {
    Event(Event),
    /// Runs once every event queued before it by the same stream is pushed
    Commit(CommitHook),
}

/// A worker's save callback, executed by the forwarder.
pub struct CommitHook {
    stream_key: String,
    description: String,
    action: Box<dyn FnOnce() -> BoxFuture<'static, Result<(), ConnectorError>> + Send + Sync>,
}

impl CommitHook {
    pub fn new<F, Fut>(stream_key: impl Into<String>, description: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ConnectorError>> + Send + 'static,
    {
        Self {
            stream_key: stream_key.into(),
            description: description.into(),
            action: Box::new(move || Box::pin(action())),
        }
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub async fn run(self) -> Result<(), ConnectorError> {
        (self.action)().await
    }
}

impl fmt::Debug for CommitHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitHook")
            .field("stream_key", &self.stream_key)
            .field("description", &self.description)
            .finish()
    }
}
