pub mod runner;

pub use runner::{Supervisor, SupervisorExit, SupervisorSettings};

use crate::error::ConnectorError;
use crate::worker::{StreamWorker, WorkerContext};
use std::fmt;
use tracing::info;

/// Builds a fresh worker for a stream. Called again on every restart.
pub type WorkerFactory =
    Box<dyn Fn(WorkerContext) -> Result<StreamWorker, ConnectorError> + Send + Sync>;

/// One worker slot the supervisor keeps alive.
pub struct StreamSpec {
    pub stream_key: String,
    pub intake_key: String,
    pub factory: WorkerFactory,
}

impl StreamSpec {
    pub fn new<F>(
        stream_key: impl Into<String>,
        intake_key: impl Into<String>,
        factory: F,
    ) -> Self
    where
        F: Fn(WorkerContext) -> Result<StreamWorker, ConnectorError> + Send + Sync + 'static,
    {
        Self {
            stream_key: stream_key.into(),
            intake_key: intake_key.into(),
            factory: Box::new(factory),
        }
    }
}

impl fmt::Debug for StreamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSpec")
            .field("stream_key", &self.stream_key)
            .field("intake_key", &self.intake_key)
            .finish()
    }
}

/// Resolves on SIGINT or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
