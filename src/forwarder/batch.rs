use super::CommitHook;
use crate::event::Event;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Body of one intake POST.
#[derive(Debug, Serialize)]
pub struct IntakePayload {
    pub intake_key: String,
    pub events: Vec<String>,
}

/// Events of one stream waiting to be pushed together.
#[derive(Debug)]
pub struct Batch {
    pub batch_id: Uuid,
    pub intake_key: String,
    pub stream_key: String,
    pub events: Vec<Event>,
    /// When the oldest event entered the batch
    pub opened_at: Instant,
    commits: Vec<CommitHook>,
}

impl Batch {
    pub fn new(intake_key: impl Into<String>, stream_key: impl Into<String>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            intake_key: intake_key.into(),
            stream_key: stream_key.into(),
            events: Vec::new(),
            opened_at: Instant::now(),
            commits: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    pub fn push(&mut self, event: Event) {
        if self.events.is_empty() {
            self.opened_at = Instant::now();
        }
        self.events.push(event);
    }

    pub fn attach_commit(&mut self, hook: CommitHook) {
        self.commits.push(hook);
    }

    pub fn take_commits(&mut self) -> Vec<CommitHook> {
        std::mem::take(&mut self.commits)
    }

    pub fn payload(&self) -> IntakePayload {
        IntakePayload {
            intake_key: self.intake_key.clone(),
            events: self.events.iter().map(Event::to_intake_string).collect(),
        }
    }
}

/// Open batches keyed by stream.
#[derive(Debug)]
pub struct PendingBatches {
    intake_key: String,
    batches: HashMap<String, Batch>,
}

impl PendingBatches {
    pub fn new(intake_key: impl Into<String>) -> Self {
        Self {
            intake_key: intake_key.into(),
            batches: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.batches.values().all(Batch::is_empty)
    }

    pub fn event_count(&self) -> usize {
        self.batches.values().map(Batch::len).sum()
    }

    /// Add an event; returns the stream's batch once it reaches `chunk_size`.
    pub fn push(&mut self, event: Event, chunk_size: usize) -> Option<Batch> {
        let stream_key = event.stream_key.clone();
        let batch = self
            .batches
            .entry(stream_key.clone())
            .or_insert_with(|| Batch::new(self.intake_key.clone(), stream_key.clone()));
        batch.push(event);
        if batch.len() >= chunk_size.max(1) {
            return self.batches.remove(&stream_key);
        }
        None
    }

    /// Park a commit behind the stream's open batch. Hands it back when
    /// nothing is pending for that stream, so the caller can run it now.
    pub fn attach_commit(&mut self, hook: CommitHook) -> Option<CommitHook> {
        match self.batches.get_mut(hook.stream_key()) {
            Some(batch) if !batch.is_empty() => {
                batch.attach_commit(hook);
                None
            }
            _ => Some(hook),
        }
    }

    /// Earliest instant at which a batch becomes too old.
    pub fn next_deadline(&self, max_age: Duration) -> Option<Instant> {
        self.batches
            .values()
            .filter(|b| !b.is_empty())
            .map(|b| b.opened_at + max_age)
            .min()
    }

    pub fn take_expired(&mut self, max_age: Duration) -> Vec<Batch> {
        let expired: Vec<String> = self
            .batches
            .iter()
            .filter(|(_, b)| !b.is_empty() && b.age() >= max_age)
            .map(|(k, _)| k.clone())
            .collect();
        let mut out: Vec<Batch> = expired
            .iter()
            .filter_map(|k| self.batches.remove(k))
            .collect();
        out.sort_by_key(|b| b.opened_at);
        out
    }

    pub fn take_all(&mut self) -> Vec<Batch> {
        let mut out: Vec<Batch> = self.batches.drain().map(|(_, b)| b).collect();
        out.sort_by_key(|b| b.opened_at);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn event(stream: &str, n: u32) -> Event {
        Event::new(stream, Utc::now(), format!("fp-{}", n), json!({ "n": n }))
    }

    fn hook(stream: &str) -> CommitHook {
        CommitHook::new(stream, "test", || async { Ok(()) })
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_emitted_at_chunk_size() {
        let mut pending = PendingBatches::new("key");
        assert!(pending.push(event("s", 1), 2).is_none());
        let batch = pending.push(event("s", 2), 2).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.stream_key, "s");
        assert!(pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_batch_separately() {
        let mut pending = PendingBatches::new("key");
        pending.push(event("a", 1), 10);
        pending.push(event("b", 2), 10);
        pending.push(event("a", 3), 10);
        assert_eq!(pending.event_count(), 3);

        let all = pending.take_all();
        assert_eq!(all.len(), 2);
        let a = all.iter().find(|b| b.stream_key == "a").unwrap();
        assert_eq!(a.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_uses_oldest_event() {
        let mut pending = PendingBatches::new("key");
        let max_age = Duration::from_secs(5);
        assert!(pending.next_deadline(max_age).is_none());

        let start = Instant::now();
        pending.push(event("s", 1), 10);
        tokio::time::advance(Duration::from_secs(3)).await;
        pending.push(event("s", 2), 10);

        assert_eq!(pending.next_deadline(max_age), Some(start + max_age));
        assert!(pending.take_expired(max_age).is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        let expired = pending.take_expired(max_age);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_waits_behind_open_batch() {
        let mut pending = PendingBatches::new("key");
        // Nothing pending: run immediately
        assert!(pending.attach_commit(hook("s")).is_some());

        pending.push(event("s", 1), 10);
        assert!(pending.attach_commit(hook("s")).is_none());
        // Other streams are unaffected
        assert!(pending.attach_commit(hook("t")).is_some());

        let mut batch = pending.take_all().pop().unwrap();
        assert_eq!(batch.take_commits().len(), 1);
    }

    #[test]
    fn test_payload_shape() {
        let mut batch = Batch::new("intake-1", "s");
        batch.push(event("s", 1));
        batch.push(Event::new("s", Utc::now(), "raw", json!("<13>raw line")));

        let body = serde_json::to_value(batch.payload()).unwrap();
        assert_eq!(body["intake_key"], "intake-1");
        assert_eq!(body["events"][0], r#"{"n":1}"#);
        assert_eq!(body["events"][1], "<13>raw line");
    }
}
