use super::definition::AggregationDefinition;
use crate::clock::SharedClock;
use crate::event::Event;
use crate::forwarder::{Envelope, QueueSender};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a final flush may wait on a full queue.
const FINAL_SEND_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Bucket {
    first_event: Event,
    /// Repeats folded into `first_event`, which itself was already emitted.
    /// A bucket closing with zero repeats emits no summary.
    count: u64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    opened_at: Instant,
    ttl: Duration,
}

impl Bucket {
    fn into_summary(self) -> Event {
        let repeat = json!({
            "count": self.count,
            "first_seen": self.first_seen.to_rfc3339(),
            "last_seen": self.last_seen.to_rfc3339(),
        });
        let mut event = self.first_event;
        event.payload = match event.payload {
            Value::Object(mut map) => {
                map.insert("repeat".to_string(), repeat);
                Value::Object(map)
            }
            other => json!({ "message": other, "repeat": repeat }),
        };
        event.fingerprint = format!("{}#repeat@{}", event.fingerprint, self.first_seen.timestamp_millis());
        event
    }
}

/// Folds repeating events into one representative per fingerprint and TTL.
#[derive(Debug)]
pub struct EventAggregator {
    definitions: Vec<AggregationDefinition>,
    buckets: Mutex<HashMap<(String, String), Bucket>>,
    closed: AtomicBool,
    clock: SharedClock,
}

impl EventAggregator {
    pub fn new(definitions: Vec<AggregationDefinition>, clock: SharedClock) -> Self {
        Self {
            definitions,
            buckets: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            clock,
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.lock().len()
    }

    /// Returns the event to forward, or `None` when it was folded into a bucket.
    ///
    /// The first definition whose condition holds decides. A definition that
    /// fails to evaluate is skipped for this event.
    pub fn aggregate(&self, event: Event) -> Option<Event> {
        if self.closed.load(Ordering::SeqCst) {
            debug!(fingerprint = %event.fingerprint, "Aggregator closed, discarding event");
            return None;
        }

        for definition in &self.definitions {
            match definition.matches(&event) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(definition = %definition.name, error = %e, "Aggregation condition failed");
                    continue;
                }
            }
            let fingerprint = match definition.fingerprint(&event) {
                Ok(fp) => fp,
                Err(e) => {
                    warn!(definition = %definition.name, error = %e, "Aggregation fingerprint failed");
                    continue;
                }
            };

            let now = self.clock.now();
            let mut buckets = self.lock();
            let key = (definition.name.clone(), fingerprint);
            if let Some(bucket) = buckets.get_mut(&key) {
                bucket.count += 1;
                bucket.last_seen = now;
                return None;
            }
            buckets.insert(
                key,
                Bucket {
                    first_event: event.clone(),
                    count: 0,
                    first_seen: now,
                    last_seen: now,
                    opened_at: Instant::now(),
                    ttl: definition.ttl,
                },
            );
            return Some(event);
        }
        Some(event)
    }

    /// Remove buckets open for at least their TTL and return their summaries.
    /// Buckets that saw no repeats close silently.
    pub fn flush_expired(&self) -> Vec<Event> {
        let mut buckets = self.lock();
        let expired: Vec<(String, String)> = buckets
            .iter()
            .filter(|(_, b)| b.opened_at.elapsed() >= b.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        let mut closed: Vec<Bucket> = expired.iter().filter_map(|k| buckets.remove(k)).collect();
        drop(buckets);

        closed.sort_by_key(|b| b.opened_at);
        closed
            .into_iter()
            .filter(|b| b.count > 0)
            .map(Bucket::into_summary)
            .collect()
    }

    /// Stop accepting events and summarise every open bucket.
    pub fn close_and_flush_all(&self) -> Vec<Event> {
        self.closed.store(true, Ordering::SeqCst);
        let mut closed: Vec<Bucket> = self.lock().drain().map(|(_, b)| b).collect();
        closed.sort_by_key(|b| b.opened_at);
        closed
            .into_iter()
            .filter(|b| b.count > 0)
            .map(Bucket::into_summary)
            .collect()
    }

    /// Scan buckets every `interval` until `stop` fires, then flush everything.
    pub async fn run_flusher(
        self: Arc<Self>,
        interval: Duration,
        queue: QueueSender,
        stop: CancellationToken,
    ) {
        // Summaries already taken out of their buckets but not yet queued
        let mut unsent: VecDeque<Event> = VecDeque::new();
        'scan: loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    unsent.extend(self.flush_expired());
                    while let Some(summary) = unsent.pop_front() {
                        tokio::select! {
                            permit = queue.reserve() => match permit {
                                Ok(permit) => permit.send(Envelope::Event(summary)),
                                Err(_) => return,
                            },
                            _ = stop.cancelled() => {
                                unsent.push_front(summary);
                                break 'scan;
                            }
                        }
                    }
                }
            }
        }

        let mut remaining: Vec<Event> = unsent.into_iter().collect();
        remaining.extend(self.close_and_flush_all());
        if remaining.is_empty() {
            return;
        }
        info!(summaries = remaining.len(), "Flushing aggregation buckets at shutdown");
        for summary in remaining {
            match tokio::time::timeout(FINAL_SEND_TIMEOUT, queue.send(Envelope::Event(summary))).await {
                Ok(Ok(())) => {}
                _ => {
                    warn!("Queue unavailable, dropping remaining aggregation summaries");
                    return;
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, String), Bucket>> {
        self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::forwarder::create_queue;
    use chrono::TimeZone;

    fn clock() -> SharedClock {
        Arc::new(MockClock::starting_at(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()))
    }

    fn constant(ttl: Duration) -> AggregationDefinition {
        AggregationDefinition::new("all", ttl, |_| Ok(true), |_| Ok("F".to_string()))
    }

    fn event() -> Event {
        Event::new("s", Utc::now(), "e", json!({ "user": "alice" }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeats_fold_into_one_summary() {
        let agg = EventAggregator::new(vec![constant(Duration::from_secs(2))], clock());

        let e = event();
        assert_eq!(agg.aggregate(e.clone()), Some(e.clone()));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(agg.aggregate(e.clone()), None);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(agg.aggregate(e.clone()), None);

        assert!(agg.flush_expired().is_empty());
        tokio::time::advance(Duration::from_millis(2300)).await;

        let flushed = agg.flush_expired();
        assert_eq!(flushed.len(), 1);
        let repeat = &flushed[0].payload["repeat"];
        assert_eq!(repeat["count"], 2);
        assert_eq!(flushed[0].payload["user"], "alice");
        let first: DateTime<Utc> = repeat["first_seen"].as_str().unwrap().parse().unwrap();
        let last: DateTime<Utc> = repeat["last_seen"].as_str().unwrap().parse().unwrap();
        assert!(first <= last);
        assert_eq!(agg.bucket_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_event_closes_silently() {
        let agg = EventAggregator::new(vec![constant(Duration::from_secs(1))], clock());
        assert!(agg.aggregate(event()).is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(agg.flush_expired().is_empty());
        assert_eq!(agg.bucket_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_definition_passes_event_through() {
        let broken = AggregationDefinition::new(
            "broken",
            Duration::from_secs(1),
            |_| Err("bad pointer".to_string()),
            |_| Ok("F".to_string()),
        );
        let agg = EventAggregator::new(vec![broken], clock());
        let e = event();
        assert_eq!(agg.aggregate(e.clone()), Some(e.clone()));
        assert_eq!(agg.aggregate(e.clone()), Some(e));
        assert_eq!(agg.bucket_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_object_payload_is_wrapped() {
        let agg = EventAggregator::new(vec![constant(Duration::from_secs(1))], clock());
        let raw = Event::new("s", Utc::now(), "r", json!("raw line"));
        agg.aggregate(raw.clone());
        agg.aggregate(raw);
        let summary = agg.close_and_flush_all().pop().unwrap();
        assert_eq!(summary.payload["message"], "raw line");
        assert_eq!(summary.payload["repeat"]["count"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_aggregator_discards() {
        let agg = EventAggregator::new(vec![constant(Duration::from_secs(1))], clock());
        agg.close_and_flush_all();
        assert_eq!(agg.aggregate(event()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flusher_emits_and_flushes_on_stop() {
        let agg = Arc::new(EventAggregator::new(vec![constant(Duration::from_secs(2))], clock()));
        let (tx, mut rx) = create_queue(10);
        let stop = CancellationToken::new();
        let handle = tokio::spawn(agg.clone().run_flusher(Duration::from_millis(500), tx, stop.clone()));

        agg.aggregate(event());
        agg.aggregate(event());
        tokio::time::sleep(Duration::from_secs(3)).await;
        match rx.try_recv().unwrap() {
            Envelope::Event(e) => assert_eq!(e.payload["repeat"]["count"], 1),
            other => panic!("unexpected {:?}", other),
        }

        // A bucket still open at stop is flushed before the task returns
        agg.aggregate(event());
        agg.aggregate(event());
        stop.cancel();
        handle.await.unwrap();
        match rx.try_recv().unwrap() {
            Envelope::Event(e) => assert_eq!(e.payload["repeat"]["count"], 1),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(agg.aggregate(event()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_send_keeps_expired_summaries() {
        let by_user = AggregationDefinition::new(
            "by-user",
            Duration::from_secs(2),
            |_| Ok(true),
            |e| Ok(e.payload["user"].as_str().unwrap_or_default().to_string()),
        );
        let agg = Arc::new(EventAggregator::new(vec![by_user], clock()));
        for user in ["a", "b"] {
            for _ in 0..3 {
                agg.aggregate(Event::new("s", Utc::now(), user, json!({ "user": user })));
            }
            tokio::time::advance(Duration::from_millis(10)).await;
        }

        let (tx, mut rx) = create_queue(1);
        tx.send(Envelope::Event(Event::new("s", Utc::now(), "filler", json!({}))))
            .await
            .unwrap();
        let stop = CancellationToken::new();
        let handle = tokio::spawn(agg.clone().run_flusher(Duration::from_millis(2500), tx, stop.clone()));

        // Both buckets expire and leave the map, then the send blocks on the full queue
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(agg.bucket_count(), 0);
        stop.cancel();

        let mut received = Vec::new();
        while let Some(Envelope::Event(e)) = rx.recv().await {
            received.push((e.payload["user"].as_str().map(str::to_string), e.payload["repeat"]["count"].clone()));
        }
        handle.await.unwrap();
        assert_eq!(
            received,
            vec![
                (None, Value::Null),
                (Some("a".to_string()), json!(2)),
                (Some("b".to_string()), json!(2)),
            ]
        );
    }
}
