use crate::clock::{earlier, Clock};
use crate::storage::{CheckpointStore, DedupRecord};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// LRU of recently forwarded fingerprints with a time-to-live.
///
/// A fingerprint counts as present only if it was remembered less than `ttl`
/// ago. Capacity evictions drop the least recently remembered entry.
#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<String, Entry>,
    /// Recency order: tick -> fingerprint, oldest first
    order: BTreeMap<u64, String>,
    next_tick: u64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    inserted_at: Instant,
    tick: u64,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the fingerprint was remembered within the TTL.
    ///
    /// An expired entry is evicted on the way.
    pub fn seen(&mut self, fingerprint: &str) -> bool {
        let Some(entry) = self.entries.get(fingerprint).copied() else {
            return false;
        };

        if entry.inserted_at.elapsed() >= self.ttl {
            self.entries.remove(fingerprint);
            self.order.remove(&entry.tick);
            return false;
        }
        true
    }

    /// Insert or refresh a fingerprint as the most recent entry.
    pub fn remember(&mut self, fingerprint: &str) {
        self.insert_at(fingerprint.to_string(), Instant::now());
    }

    /// Active entries with wall-clock insertion times, oldest first.
    pub fn snapshot(&self, clock: &dyn Clock) -> Vec<DedupRecord> {
        let now = clock.now();
        self.order
            .values()
            .filter_map(|fp| {
                let entry = self.entries.get(fp)?;
                let age = entry.inserted_at.elapsed();
                if age >= self.ttl {
                    return None;
                }
                Some(DedupRecord {
                    fingerprint: fp.clone(),
                    inserted_at: earlier(now, age),
                })
            })
            .collect()
    }

    /// Rehydrate from persisted records, skipping those already past the TTL.
    pub fn restore(&mut self, records: Vec<DedupRecord>, clock: &dyn Clock) -> usize {
        let now_wall = clock.now();
        let now = Instant::now();
        let mut sorted = records;
        sorted.sort_by_key(|r| r.inserted_at);

        let mut restored = 0;
        for record in sorted {
            let age = (now_wall - record.inserted_at).to_std().unwrap_or(Duration::ZERO);
            if age >= self.ttl {
                continue;
            }
            let inserted_at = now.checked_sub(age).unwrap_or(now);
            self.insert_at(record.fingerprint, inserted_at);
            restored += 1;
        }
        restored
    }

    /// Fingerprints currently held, least recent first. Includes expired
    /// entries that have not been evicted yet.
    pub fn fingerprints(&self) -> Vec<String> {
        self.order.values().cloned().collect()
    }

    fn insert_at(&mut self, fingerprint: String, inserted_at: Instant) {
        let tick = self.next_tick;
        self.next_tick += 1;

        if let Some(previous) = self.entries.get(&fingerprint) {
            self.order.remove(&previous.tick);
        } else if self.entries.len() >= self.capacity {
            self.evict_least_recent();
        }

        self.order.insert(tick, fingerprint.clone());
        self.entries.insert(fingerprint, Entry { inserted_at, tick });
    }

    fn evict_least_recent(&mut self) {
        if let Some((_, fingerprint)) = self.order.pop_first() {
            self.entries.remove(&fingerprint);
        }
    }
}

/// Load a stream's persisted fingerprints into a fresh cache.
pub async fn load_persisted(
    store: &CheckpointStore,
    stream_key: &str,
    capacity: usize,
    ttl: Duration,
    clock: &dyn Clock,
) -> DedupCache {
    let mut cache = DedupCache::new(capacity, ttl);
    let records = store.load_dedup(stream_key).await;
    let total = records.len();
    let restored = cache.restore(records, clock);
    if total > 0 {
        tracing::info!(
            stream_key = %stream_key,
            restored = restored,
            expired = total - restored,
            "Rehydrated dedup cache"
        );
    }
    cache
}
