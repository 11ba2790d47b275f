use super::{shutdown_signal, StreamSpec};
use crate::clock::SharedClock;
use crate::error::ErrorKind;
use crate::forwarder::{create_queue, BatchForwarder, ForwarderSettings, ForwarderStats, IntakeSink, QueueSender};
use crate::storage::CheckpointStore;
use crate::telemetry::SharedMetrics;
use crate::worker::{WorkerContext, WorkerHandle, WorkerOutcome};
use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub queue_size: usize,
    /// Forwarders per intake key
    pub nb_forwarders: usize,
    pub supervise_interval: Duration,
    pub restart_cooldown: Duration,
    pub consumer_join_timeout: Duration,
    pub forwarder_join_timeout: Duration,
    pub forwarder: ForwarderSettings,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            nb_forwarders: 1,
            supervise_interval: Duration::from_secs(5),
            restart_cooldown: Duration::from_secs(5),
            consumer_join_timeout: Duration::from_secs(2),
            forwarder_join_timeout: Duration::from_secs(5),
            forwarder: ForwarderSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    Clean,
    /// Every worker stopped on rejected credentials
    AuthFailure,
}

impl SupervisorExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisorExit::Clean => 0,
            SupervisorExit::AuthFailure => 1,
        }
    }
}

enum SlotState {
    Running(WorkerHandle),
    CoolingDown { since: Instant },
    /// Not restarted again
    Stopped(ErrorKind),
}

struct Slot {
    spec: StreamSpec,
    ctx: WorkerContext,
    state: SlotState,
    starts: u32,
}

/// Keeps one worker per stream alive and owns the forwarders they feed.
pub struct Supervisor {
    settings: SupervisorSettings,
    store: CheckpointStore,
    metrics: SharedMetrics,
    clock: SharedClock,
    sink: Arc<dyn IntakeSink>,
    streams: Vec<StreamSpec>,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        store: CheckpointStore,
        metrics: SharedMetrics,
        clock: SharedClock,
        sink: Arc<dyn IntakeSink>,
    ) -> Self {
        Self {
            settings,
            store,
            metrics,
            clock,
            sink,
            streams: Vec::new(),
        }
    }

    pub fn add_stream(&mut self, spec: StreamSpec) {
        self.streams.push(spec);
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Run until SIGINT/SIGTERM or until every worker has failed authentication.
    pub async fn run_until_signal(self) -> SupervisorExit {
        self.run(shutdown_signal()).await
    }

    pub async fn run<S>(self, shutdown: S) -> SupervisorExit
    where
        S: Future<Output = ()>,
    {
        let Supervisor {
            settings,
            store,
            metrics,
            clock,
            sink,
            streams,
        } = self;

        let worker_stop = CancellationToken::new();
        let forwarder_stop = CancellationToken::new();

        let (queues, forwarders) = spawn_forwarders(&settings, &streams, &sink, &metrics, &forwarder_stop);

        let mut slots: Vec<Slot> = streams
            .into_iter()
            .filter_map(|spec| {
                let queue = queues.get(&spec.stream_key)?.clone();
                let ctx = WorkerContext {
                    stream_key: spec.stream_key.clone(),
                    intake_key: spec.intake_key.clone(),
                    queue,
                    store: store.clone(),
                    metrics: metrics.clone(),
                    clock: clock.clone(),
                };
                Some(Slot {
                    spec,
                    ctx,
                    state: SlotState::CoolingDown { since: Instant::now() },
                    starts: 0,
                })
            })
            .collect();
        drop(queues);

        for slot in &mut slots {
            slot.state = start(slot, &worker_stop);
        }
        info!(
            workers = slots.len(),
            forwarders = forwarders.len(),
            "Supervisor started"
        );

        let mut interval = tokio::time::interval(settings.supervise_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        tokio::pin!(shutdown);
        let mut exit = SupervisorExit::Clean;
        let mut idle_warned = false;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = interval.tick() => {}
            }

            for slot in &mut slots {
                supervise(slot, &settings, &worker_stop).await;
            }

            let live = slots
                .iter()
                .filter(|s| !matches!(s.state, SlotState::Stopped(_)))
                .count();
            let auth_failed = slots
                .iter()
                .filter(|s| matches!(s.state, SlotState::Stopped(ErrorKind::Auth)))
                .count();
            if live == 0 && auth_failed > 0 {
                error!(workers = auth_failed, "All workers stopped on authentication errors");
                exit = SupervisorExit::AuthFailure;
                break;
            }
            if live == 0 && !idle_warned {
                warn!("No worker is running; waiting for shutdown");
                idle_warned = true;
            }
        }

        shutdown_all(slots, forwarders, &settings, &worker_stop, &forwarder_stop).await;
        exit
    }
}

/// One set of forwarder queues per intake key. Streams are spread
/// round-robin over them; every slot of one stream shares a queue.
fn spawn_forwarders(
    settings: &SupervisorSettings,
    streams: &[StreamSpec],
    sink: &Arc<dyn IntakeSink>,
    metrics: &SharedMetrics,
    stop: &CancellationToken,
) -> (HashMap<String, QueueSender>, Vec<(String, JoinHandle<ForwarderStats>)>) {
    let mut by_intake: HashMap<String, (Vec<QueueSender>, usize)> = HashMap::new();
    let mut assigned: HashMap<String, QueueSender> = HashMap::new();
    let mut forwarders = Vec::new();

    for spec in streams {
        if assigned.contains_key(&spec.stream_key) {
            continue;
        }
        let (senders, next) = by_intake.entry(spec.intake_key.clone()).or_insert_with(|| {
            let senders = (0..settings.nb_forwarders.max(1))
                .map(|_| {
                    let name = format!("forwarder-{}", forwarders.len());
                    let (tx, rx) = create_queue(settings.queue_size);
                    let forwarder = BatchForwarder::new(
                        name.clone(),
                        spec.intake_key.clone(),
                        settings.forwarder.clone(),
                        rx,
                        sink.clone(),
                        metrics.clone(),
                    );
                    forwarders.push((name, tokio::spawn(forwarder.run(stop.clone()))));
                    tx
                })
                .collect();
            (senders, 0)
        });
        let sender = senders[*next % senders.len()].clone();
        *next += 1;
        debug!(stream_key = %spec.stream_key, "Assigned stream to forwarder queue");
        assigned.insert(spec.stream_key.clone(), sender);
    }
    (assigned, forwarders)
}

/// Build and spawn a fresh worker for the slot.
fn start(slot: &mut Slot, stop: &CancellationToken) -> SlotState {
    match (slot.spec.factory)(slot.ctx.clone()) {
        Ok(worker) => {
            slot.starts += 1;
            if slot.starts > 1 {
                info!(worker = %slot.spec.stream_key, starts = slot.starts, "Restarting worker");
            }
            SlotState::Running(WorkerHandle::spawn(worker, stop))
        }
        Err(e) if e.kind() == ErrorKind::Config => {
            error!(worker = %slot.spec.stream_key, error = %e, "Invalid stream configuration, not starting");
            SlotState::Stopped(ErrorKind::Config)
        }
        Err(e) => {
            warn!(worker = %slot.spec.stream_key, kind = e.kind().label(), error = %e, "Worker could not be built");
            SlotState::CoolingDown { since: Instant::now() }
        }
    }
}

async fn supervise(slot: &mut Slot, settings: &SupervisorSettings, stop: &CancellationToken) {
    if let SlotState::Running(handle) = &mut slot.state {
        let Some(outcome) = handle.outcome().await else {
            return;
        };
        slot.state = match outcome {
            WorkerOutcome::Failed(e) if matches!(e.kind(), ErrorKind::Auth | ErrorKind::Config) => {
                error!(
                    worker = %slot.spec.stream_key,
                    kind = e.kind().label(),
                    error = %e,
                    "Worker stopped and will not be restarted"
                );
                SlotState::Stopped(e.kind())
            }
            WorkerOutcome::Failed(e) => {
                warn!(worker = %slot.spec.stream_key, kind = e.kind().label(), error = %e, "Worker died");
                SlotState::CoolingDown { since: Instant::now() }
            }
            WorkerOutcome::Panicked(reason) => {
                warn!(worker = %slot.spec.stream_key, reason = %reason, "Worker panicked");
                SlotState::CoolingDown { since: Instant::now() }
            }
            WorkerOutcome::Completed => {
                warn!(worker = %slot.spec.stream_key, "Worker returned unexpectedly");
                SlotState::CoolingDown { since: Instant::now() }
            }
        };
    }

    if let SlotState::CoolingDown { since } = slot.state {
        if since.elapsed() >= settings.restart_cooldown {
            slot.state = start(slot, stop);
        }
    }
}

/// Stop workers, then forwarders, each with a bounded wait.
async fn shutdown_all(
    slots: Vec<Slot>,
    forwarders: Vec<(String, JoinHandle<ForwarderStats>)>,
    settings: &SupervisorSettings,
    worker_stop: &CancellationToken,
    forwarder_stop: &CancellationToken,
) {
    worker_stop.cancel();
    let handles: Vec<WorkerHandle> = slots
        .into_iter()
        .filter_map(|slot| match slot.state {
            SlotState::Running(handle) => Some(handle),
            _ => None,
        })
        .collect();
    info!(workers = handles.len(), "Stopping workers");
    let timeout = settings.consumer_join_timeout;
    for outcome in join_all(handles.into_iter().map(|h| h.join(timeout))).await {
        if let Some(WorkerOutcome::Failed(e)) = outcome {
            debug!(kind = e.kind().label(), error = %e, "Worker exited with error during shutdown");
        }
    }

    // Producers are gone; forwarders drain what is queued and push it
    forwarder_stop.cancel();
    info!(forwarders = forwarders.len(), "Stopping forwarders");
    let timeout = settings.forwarder_join_timeout;
    let joins = forwarders.into_iter().map(|(name, mut handle)| async move {
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(stats)) => {
                if stats.events_pending > 0 {
                    warn!(forwarder = %name, pending = stats.events_pending, "Forwarder stopped with unpushed events");
                }
            }
            Ok(Err(e)) => error!(forwarder = %name, error = %e, "Forwarder task failed"),
            Err(_) => {
                warn!(forwarder = %name, "Forwarder did not stop in time, abandoning it");
                handle.abort();
            }
        }
    });
    join_all(joins).await;
    info!("Shutdown complete");
}
