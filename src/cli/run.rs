use crate::clock::{self, SharedClock};
use crate::config::types::Config;
use crate::config::{load_config, ConfigError};
use crate::drivers::{build_client, stream_specs};
use crate::error::ConnectorError;
use crate::forwarder::{ForwarderSettings, IntakeClient};
use crate::http::RetryPolicy;
use crate::storage::{CheckpointStore, StorageError};
use crate::supervisor::{Supervisor, SupervisorExit, SupervisorSettings};
use crate::telemetry::{FacadeMetrics, SharedMetrics};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Delay between push attempts of a batch the intake could not take.
const INTAKE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config not found; searched ~/.config/conveyor/config.yml and /etc/conveyor/config.yml")]
    NoConfig,

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Connector(#[from] ConnectorError),

    #[error("no enabled streams")]
    NoStreams,
}

pub async fn run(config_path: Option<PathBuf>) -> Result<SupervisorExit, RunError> {
    let config_path = config_path.ok_or(RunError::NoConfig)?;
    run_with(&config_path).await
}

async fn run_with(config_path: &Path) -> Result<SupervisorExit, RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;

    let connections_stop = CancellationToken::new();
    let supervisor = build_supervisor(
        &config,
        clock::system(),
        FacadeMetrics::shared(),
        connections_stop.clone(),
    )
    .await?;

    let exit = supervisor.run_until_signal().await;
    connections_stop.cancel();
    info!(exit_code = exit.exit_code(), "Conveyor stopped");
    Ok(exit)
}

/// Wire every configured component into a ready-to-run supervisor.
///
/// `connections_stop` aborts vendor requests still retrying once the
/// supervisor has returned.
pub async fn build_supervisor(
    config: &Config,
    clock: SharedClock,
    metrics: SharedMetrics,
    connections_stop: CancellationToken,
) -> Result<Supervisor, RunError> {
    info!(path = %config.data_dir.display(), "Opening checkpoint store");
    let store = CheckpointStore::open(&config.data_dir).await?;

    let retry = RetryPolicy::new(config.intake.max_retries, INTAKE_BACKOFF);
    let sink = IntakeClient::new(
        &config.intake.server,
        &config.intake.path,
        config.intake.timeout,
        retry.clone(),
    )?;
    info!(url = %sink.url(), "Intake configured");

    let mut clients = BTreeMap::new();
    for (name, connection) in &config.connections {
        let client = build_client(name, connection, clock.clone(), connections_stop.clone())?;
        clients.insert(name.clone(), client);
    }

    let runtime = &config.runtime;
    let settings = SupervisorSettings {
        queue_size: runtime.queue_size,
        nb_forwarders: runtime.nb_forwarders,
        supervise_interval: runtime.supervise_interval,
        restart_cooldown: runtime.restart_cooldown,
        consumer_join_timeout: runtime.consumer_join_timeout,
        forwarder_join_timeout: runtime.forwarder_join_timeout,
        forwarder: ForwarderSettings {
            chunk_size: config.intake.chunk_size,
            max_flush_age: config.intake.max_flush_age,
            retry,
        },
    };

    let mut supervisor = Supervisor::new(settings, store, metrics, clock.clone(), Arc::new(sink));
    for spec in stream_specs(config, &clients, clock) {
        supervisor.add_stream(spec);
    }
    if supervisor.stream_count() == 0 {
        return Err(RunError::NoStreams);
    }
    info!(
        streams = supervisor.stream_count(),
        connections = clients.len(),
        "Supervisor ready"
    );
    Ok(supervisor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;

    fn config_yaml(data_dir: &Path, enabled: bool) -> String {
        format!(
            r#"
data_dir: {}
intake:
  server: http://127.0.0.1:9
  key: k
connections:
  vendor: {{}}
streams:
  logs:
    connection: vendor
    enabled: {}
    source:
      driver: ndjson_stream
      url: http://127.0.0.1:9/stream
      timestamp: /ts
  audit:
    connection: vendor
    enabled: {}
    source:
      driver: http_json
      url: http://127.0.0.1:9/audit
      items: /data
      timestamp: /published
"#,
            data_dir.display(),
            enabled,
            enabled
        )
    }

    #[tokio::test]
    async fn test_each_stream_gets_exactly_one_slot() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_str(&config_yaml(dir.path(), true), |_| None).unwrap();
        let supervisor = build_supervisor(
            &config,
            clock::system(),
            FacadeMetrics::shared(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(supervisor.stream_count(), 2);
    }

    #[tokio::test]
    async fn test_all_streams_disabled_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_str(&config_yaml(dir.path(), false), |_| None).unwrap();
        let result = build_supervisor(
            &config,
            clock::system(),
            FacadeMetrics::shared(),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(RunError::NoStreams)));
    }

    #[tokio::test]
    async fn test_missing_config_path() {
        assert!(matches!(run(None).await, Err(RunError::NoConfig)));
    }
}
