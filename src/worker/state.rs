//! Per-stream state shared by pull and push workers: checkpoint, dedup,
//! aggregation and the hand-off to the forwarder queue.

use super::{enqueue, WorkerContext};
use crate::aggregate::EventAggregator;
use crate::dedup::{self, DedupCache};
use crate::error::{ConnectorError, ErrorKind};
use crate::event::{Event, RejectedEvent};
use crate::forwarder::{CommitHook, Envelope};
use crate::storage::{CheckpointValue, DedupRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Smallest step past the newest timestamp when a page has no cursor.
const TIMESTAMP_EPSILON_MS: i64 = 1;

/// One unit of upstream data: the events of a page or a pushed message.
#[derive(Debug, Default)]
pub struct Page {
    pub events: Vec<Event>,
    pub rejected: Vec<RejectedEvent>,
    /// Position after this page, as reported by the upstream API
    pub next_cursor: Option<CheckpointValue>,
}

impl Page {
    pub fn new(events: Vec<Event>, next_cursor: Option<CheckpointValue>) -> Self {
        Self {
            events,
            rejected: Vec::new(),
            next_cursor,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_rejected(mut self, rejected: Vec<RejectedEvent>) -> Self {
        self.rejected = rejected;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.rejected.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupSettings {
    pub capacity: usize,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Mirror fingerprints to the checkpoint store
    #[serde(default)]
    pub persist: bool,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Duration::from_secs(3600),
            persist: false,
        }
    }
}

/// Counters for one tick or message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageStats {
    pub received: usize,
    pub duplicates: usize,
    pub aggregated: usize,
    pub rejected: usize,
    pub forwarded: usize,
}

impl PageStats {
    pub fn absorb(&mut self, other: PageStats) {
        self.received += other.received;
        self.duplicates += other.duplicates;
        self.aggregated += other.aggregated;
        self.rejected += other.rejected;
        self.forwarded += other.forwarded;
    }
}

pub struct StreamState {
    checkpoint: Option<CheckpointValue>,
    /// Checkpoint advanced in memory but not yet handed to the forwarder
    dirty: bool,
    dedup: Option<DedupCache>,
    persist_dedup: bool,
    aggregator: Option<std::sync::Arc<EventAggregator>>,
}

impl StreamState {
    /// Load the persisted checkpoint and, when enabled, the dedup cache.
    pub async fn load(
        ctx: &WorkerContext,
        dedup: Option<&DedupSettings>,
        aggregator: Option<std::sync::Arc<EventAggregator>>,
    ) -> Self {
        let checkpoint = ctx.store.load(&ctx.stream_key).await.map(|c| c.value);
        let cache = match dedup {
            Some(settings) if settings.persist => Some(
                dedup::load_persisted(
                    &ctx.store,
                    &ctx.stream_key,
                    settings.capacity,
                    settings.ttl,
                    ctx.clock.as_ref(),
                )
                .await,
            ),
            Some(settings) => Some(DedupCache::new(settings.capacity, settings.ttl)),
            None => None,
        };
        info!(
            stream_key = %ctx.stream_key,
            checkpoint = %checkpoint.as_ref().map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()),
            dedup = cache.is_some(),
            "Stream state loaded"
        );
        Self {
            checkpoint,
            dirty: false,
            dedup: cache,
            persist_dedup: dedup.map(|d| d.persist).unwrap_or(false),
            aggregator,
        }
    }

    pub fn checkpoint(&self) -> Option<&CheckpointValue> {
        self.checkpoint.as_ref()
    }

    pub fn dedup(&self) -> Option<&DedupCache> {
        self.dedup.as_ref()
    }

    /// Dedup, aggregate and enqueue a page, then move the in-memory checkpoint.
    ///
    /// Events are enqueued in the order the page lists them. On error the
    /// checkpoint is left where it was.
    pub async fn process_page(
        &mut self,
        page: Page,
        ctx: &WorkerContext,
        stop: &CancellationToken,
    ) -> Result<PageStats, ConnectorError> {
        let labels = ctx.labels();
        let mut stats = PageStats {
            received: page.events.len(),
            rejected: page.rejected.len(),
            ..Default::default()
        };

        for rejected in &page.rejected {
            warn!(
                stream_key = %ctx.stream_key,
                fingerprint = rejected.fingerprint.as_deref().unwrap_or("-"),
                reason = %rejected.reason,
                kind = ErrorKind::Parse.label(),
                "Dropping unparseable event"
            );
        }
        if !page.rejected.is_empty() {
            ctx.metrics.parse_errors(
                &labels.with_kind(ErrorKind::Parse.label()),
                page.rejected.len() as u64,
            );
        }

        let newest = page.events.iter().map(|e| e.timestamp).max();
        let mut kept = Vec::with_capacity(page.events.len());
        // Fingerprints enter the cache only once their event is queued, so
        // repeats inside this page are caught here
        let mut in_page = HashSet::new();
        for event in page.events {
            if let Some(cache) = self.dedup.as_mut() {
                if cache.seen(&event.fingerprint) || !in_page.insert(event.fingerprint.clone()) {
                    stats.duplicates += 1;
                    continue;
                }
            }
            kept.push(event);
        }

        if let Some(newest) = newest {
            let lag = (ctx.clock.now() - newest).to_std().unwrap_or(Duration::ZERO);
            ctx.metrics.events_lag(&labels, lag);
        }
        ctx.metrics.incoming_events(&labels, kept.len() as u64);

        for event in kept {
            let fingerprint = event.fingerprint.clone();
            let event = match &self.aggregator {
                Some(aggregator) => match aggregator.aggregate(event) {
                    Some(event) => event,
                    None => {
                        stats.aggregated += 1;
                        self.remember(&fingerprint);
                        continue;
                    }
                },
                None => event,
            };
            enqueue(&ctx.queue, Envelope::Event(event), stop).await?;
            self.remember(&fingerprint);
            stats.forwarded += 1;
        }

        let next = match page.next_cursor {
            Some(cursor) => Some(cursor),
            None => match (&self.checkpoint, newest) {
                (None | Some(CheckpointValue::Timestamp(_)), Some(ts)) => Some(CheckpointValue::Timestamp(
                    ts + chrono::Duration::milliseconds(TIMESTAMP_EPSILON_MS),
                )),
                _ => None,
            },
        };
        if let Some(next) = next {
            self.advance(next, &ctx.stream_key);
        }

        if stats.duplicates > 0 {
            debug!(
                stream_key = %ctx.stream_key,
                duplicates = stats.duplicates,
                "Dropped already forwarded events"
            );
        }
        Ok(stats)
    }

    fn remember(&mut self, fingerprint: &str) {
        if let Some(cache) = self.dedup.as_mut() {
            cache.remember(fingerprint);
        }
    }

    /// Move the in-memory checkpoint forward. Regressions are ignored.
    pub fn advance(&mut self, next: CheckpointValue, stream_key: &str) -> bool {
        if let Some(current) = &self.checkpoint {
            if *current == next {
                return false;
            }
            if next.regresses(current) {
                warn!(
                    stream_key = %stream_key,
                    current = %current,
                    proposed = %next,
                    "Ignoring checkpoint that would move backwards"
                );
                return false;
            }
        }
        self.checkpoint = Some(next);
        self.dirty = true;
        true
    }

    /// Queue a save of the current checkpoint behind the events already queued.
    pub async fn commit(
        &mut self,
        ctx: &WorkerContext,
        stop: &CancellationToken,
    ) -> Result<(), ConnectorError> {
        if !self.dirty {
            return Ok(());
        }
        let Some(value) = self.checkpoint.clone() else {
            return Ok(());
        };
        let hook = checkpoint_hook(ctx, value, self.dedup_snapshot(ctx));
        enqueue(&ctx.queue, Envelope::Commit(hook), stop).await?;
        self.dirty = false;
        Ok(())
    }

    /// Best-effort final commit when the worker exits. Gives up after
    /// `timeout` if the queue stays full.
    pub async fn commit_on_exit(&mut self, ctx: &WorkerContext, timeout: Duration) {
        let hook = match (self.dirty, self.checkpoint.clone()) {
            (true, Some(value)) => checkpoint_hook(ctx, value, self.dedup_snapshot(ctx)),
            _ => match self.dedup_snapshot(ctx) {
                Some(records) => dedup_hook(ctx, records),
                None => return,
            },
        };
        match tokio::time::timeout(timeout, ctx.queue.send(Envelope::Commit(hook))).await {
            Ok(Ok(())) => self.dirty = false,
            _ => warn!(
                stream_key = %ctx.stream_key,
                "Forwarder unavailable, final checkpoint not queued"
            ),
        }
    }

    fn dedup_snapshot(&self, ctx: &WorkerContext) -> Option<Vec<DedupRecord>> {
        if !self.persist_dedup {
            return None;
        }
        self.dedup
            .as_ref()
            .map(|cache| cache.snapshot(ctx.clock.as_ref()))
    }
}

fn checkpoint_hook(
    ctx: &WorkerContext,
    value: CheckpointValue,
    dedup: Option<Vec<DedupRecord>>,
) -> CommitHook {
    let store = ctx.store.clone();
    let stream_key = ctx.stream_key.clone();
    let description = format!("checkpoint {}", value);
    CommitHook::new(ctx.stream_key.clone(), description, move || async move {
        let guard = store.lock(&stream_key).await;
        guard.save(value).await?;
        if let Some(records) = dedup {
            guard.save_dedup(&records).await?;
        }
        Ok::<(), ConnectorError>(())
    })
}

fn dedup_hook(ctx: &WorkerContext, records: Vec<DedupRecord>) -> CommitHook {
    let store = ctx.store.clone();
    let stream_key = ctx.stream_key.clone();
    CommitHook::new(ctx.stream_key.clone(), "dedup snapshot", move || async move {
        let guard = store.lock(&stream_key).await;
        guard.save_dedup(&records).await?;
        Ok::<(), ConnectorError>(())
    })
}
