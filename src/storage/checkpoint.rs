use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::{self, File};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

pub const CONTEXT_FILE: &str = "context.json";
pub const DEDUP_KEY: &str = "_dedup";

const DATE_KEY: &str = "most_recent_date_seen";
const CURSOR_KEY: &str = "most_recent_cursor_seen";
const ID_KEY: &str = "most_recent_id_seen";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("checkpoint I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("checkpoint writer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("'{0}' is reserved and cannot be used as a stream key")]
    ReservedKey(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Position of a stream: wall-clock, opaque vendor cursor, or numeric offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointValue {
    Timestamp(DateTime<Utc>),
    Cursor(String),
    Offset(u64),
}

impl CheckpointValue {
    /// True when storing `self` after `previous` would move the stream backwards.
    ///
    /// Cursors are opaque, so only timestamps and offsets can regress.
    pub fn regresses(&self, previous: &CheckpointValue) -> bool {
        match (previous, self) {
            (CheckpointValue::Timestamp(old), CheckpointValue::Timestamp(new)) => new < old,
            (CheckpointValue::Offset(old), CheckpointValue::Offset(new)) => new < old,
            _ => false,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            CheckpointValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    fn key(&self) -> &'static str {
        match self {
            CheckpointValue::Timestamp(_) => DATE_KEY,
            CheckpointValue::Cursor(_) => CURSOR_KEY,
            CheckpointValue::Offset(_) => ID_KEY,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            CheckpointValue::Timestamp(ts) => Value::String(ts.to_rfc3339()),
            CheckpointValue::Cursor(c) => Value::String(c.clone()),
            CheckpointValue::Offset(o) => Value::from(*o),
        }
    }

    /// Interpret a bare scalar left by an older writer.
    fn from_scalar(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(
                DateTime::parse_from_rfc3339(s)
                    .map(|ts| CheckpointValue::Timestamp(ts.with_timezone(&Utc)))
                    .unwrap_or_else(|_| CheckpointValue::Cursor(s.clone())),
            ),
            Value::Number(n) => n.as_u64().map(CheckpointValue::Offset),
            _ => None,
        }
    }
}

impl std::fmt::Display for CheckpointValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointValue::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            CheckpointValue::Cursor(c) => write!(f, "cursor:{}", c),
            CheckpointValue::Offset(o) => write!(f, "offset:{}", o),
        }
    }
}

/// Persisted record for one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub value: CheckpointValue,
    pub generation: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert(self.value.key().to_string(), self.value.to_json());
        map.insert("generation".to_string(), Value::from(self.generation));
        if let Some(updated_at) = self.updated_at {
            map.insert("updated_at".to_string(), Value::String(updated_at.to_rfc3339()));
        }
        Value::Object(map)
    }

    fn from_json(value: &Value) -> Option<Self> {
        let map = match value {
            Value::Object(map) => map,
            scalar => {
                return CheckpointValue::from_scalar(scalar).map(|value| Checkpoint {
                    value,
                    generation: 0,
                    updated_at: None,
                })
            }
        };

        let value = if let Some(Value::String(ts)) = map.get(DATE_KEY) {
            CheckpointValue::Timestamp(DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc))
        } else if let Some(Value::String(cursor)) = map.get(CURSOR_KEY) {
            CheckpointValue::Cursor(cursor.clone())
        } else if let Some(id) = map.get(ID_KEY).and_then(Value::as_u64) {
            CheckpointValue::Offset(id)
        } else {
            return None;
        };

        let generation = map.get("generation").and_then(Value::as_u64).unwrap_or(0);
        let updated_at = map
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|ts| ts.with_timezone(&Utc));

        Some(Checkpoint {
            value,
            generation,
            updated_at,
        })
    }
}

/// A fingerprint remembered by a dedup cache, as stored under `_dedup`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub fingerprint: String,
    pub inserted_at: DateTime<Utc>,
}

/// JSON-backed checkpoint store rooted at a module data directory.
///
/// All streams share one `context.json`. The in-memory document is the
/// source of truth for reads; every write goes through a temp file + rename
/// and only replaces the in-memory copy once the rename succeeded.
#[derive(Clone)]
pub struct CheckpointStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    path: PathBuf,
    document: AsyncMutex<Map<String, Value>>,
    stream_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("path", &self.inner.path)
            .finish()
    }
}

impl CheckpointStore {
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let path = data_dir.join(CONTEXT_FILE);

        let document = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || read_document(&data_dir, &path)).await??
        };

        tracing::info!(
            path = %path.display(),
            streams = document.keys().filter(|k| k.as_str() != DEDUP_KEY).count(),
            "Opened checkpoint store"
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                path,
                document: AsyncMutex::new(document),
                stream_locks: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Deep copy of the stream's checkpoint, if any.
    pub async fn load(&self, stream_key: &str) -> Option<Checkpoint> {
        let document = self.inner.document.lock().await;
        document.get(stream_key).and_then(Checkpoint::from_json)
    }

    /// Save under the stream lock. Returns `false` when the value would regress.
    pub async fn save(&self, stream_key: &str, value: CheckpointValue) -> Result<bool> {
        self.lock(stream_key).await.save(value).await
    }

    pub async fn lock(&self, stream_key: &str) -> StreamGuard {
        let lock = {
            let mut locks = self
                .inner
                .stream_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(stream_key.to_string()).or_default())
        };

        StreamGuard {
            store: self.clone(),
            stream_key: stream_key.to_string(),
            _lock: lock.lock_owned().await,
        }
    }

    /// Run `f` while holding the stream lock.
    pub async fn with_lock<F, Fut, T>(&self, stream_key: &str, f: F) -> T
    where
        F: FnOnce(StreamGuard) -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.lock(stream_key).await;
        f(guard).await
    }

    pub async fn load_dedup(&self, stream_key: &str) -> Vec<DedupRecord> {
        let document = self.inner.document.lock().await;
        document
            .get(DEDUP_KEY)
            .and_then(|dedup| dedup.get(stream_key))
            .and_then(|records| serde_json::from_value(records.clone()).ok())
            .unwrap_or_default()
    }

    pub async fn save_dedup(&self, stream_key: &str, records: &[DedupRecord]) -> Result<()> {
        self.lock(stream_key).await.save_dedup(records).await
    }

    async fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Map<String, Value>) -> Result<()>,
    {
        let mut document = self.inner.document.lock().await;
        let mut next = document.clone();
        mutate(&mut next)?;

        let bytes = serde_json::to_vec_pretty(&next)?;
        let path = self.inner.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes)).await??;

        *document = next;
        Ok(())
    }
}

/// Exclusive access to one stream's checkpoint.
pub struct StreamGuard {
    store: CheckpointStore,
    stream_key: String,
    _lock: OwnedMutexGuard<()>,
}

impl StreamGuard {
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub async fn load(&self) -> Option<Checkpoint> {
        self.store.load(&self.stream_key).await
    }

    pub async fn save(&self, value: CheckpointValue) -> Result<bool> {
        if self.stream_key == DEDUP_KEY {
            return Err(StorageError::ReservedKey(self.stream_key.clone()));
        }

        let previous = self.load().await;
        if let Some(previous) = &previous {
            if value.regresses(&previous.value) {
                tracing::warn!(
                    stream_key = %self.stream_key,
                    current = %previous.value,
                    rejected = %value,
                    "Refusing to move checkpoint backwards"
                );
                return Ok(false);
            }
            if previous.value == value {
                return Ok(true);
            }
        }

        let checkpoint = Checkpoint {
            value,
            generation: previous.map(|p| p.generation + 1).unwrap_or(0),
            updated_at: Some(Utc::now()),
        };
        let stream_key = self.stream_key.clone();
        self.store
            .update(move |doc| {
                doc.insert(stream_key, checkpoint.to_json());
                Ok(())
            })
            .await?;

        tracing::debug!(stream_key = %self.stream_key, "Checkpoint saved");
        Ok(true)
    }

    pub async fn save_dedup(&self, records: &[DedupRecord]) -> Result<()> {
        let encoded = serde_json::to_value(records)?;
        let stream_key = self.stream_key.clone();
        self.store
            .update(move |doc| {
                let dedup = doc
                    .entry(DEDUP_KEY.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !dedup.is_object() {
                    *dedup = Value::Object(Map::new());
                }
                if let Value::Object(dedup) = dedup {
                    dedup.insert(stream_key, encoded);
                }
                Ok(())
            })
            .await
    }
}

fn read_document(data_dir: &Path, path: &Path) -> Result<Map<String, Value>> {
    fs::create_dir_all(data_dir).map_err(|source| StorageError::Io {
        path: data_dir.to_path_buf(),
        source,
    })?;

    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(source) => {
            return Err(StorageError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) | Err(_) => {
            tracing::warn!(
                path = %path.display(),
                bytes = raw.len(),
                "Checkpoint file is truncated or not an object, starting from an empty context"
            );
            Ok(Map::new())
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let io_err = |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    };

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(".{}.{}.tmp", CONTEXT_FILE, Uuid::new_v4()));

    let written = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(e));
    }

    // Persist the rename itself.
    if let Ok(dir) = File::open(dir) {
        let _ = dir.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;
    use tempfile::TempDir;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).await.unwrap();
        assert!(store.load("auditevents").await.is_none());
        assert!(store.load_dedup("auditevents").await.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        {
            let store = CheckpointStore::open(dir.path()).await.unwrap();
            assert!(store
                .save("signinattempts", CheckpointValue::Timestamp(ts(10, 0)))
                .await
                .unwrap());
            assert!(store
                .save("itemusages", CheckpointValue::Cursor("abc==".into()))
                .await
                .unwrap());
            assert!(store
                .save("auditevents", CheckpointValue::Offset(42))
                .await
                .unwrap());
        }

        let store = CheckpointStore::open(dir.path()).await.unwrap();
        assert_eq!(
            store.load("signinattempts").await.unwrap().value,
            CheckpointValue::Timestamp(ts(10, 0))
        );
        assert_eq!(
            store.load("itemusages").await.unwrap().value,
            CheckpointValue::Cursor("abc==".into())
        );
        assert_eq!(
            store.load("auditevents").await.unwrap().value,
            CheckpointValue::Offset(42)
        );
    }

    #[tokio::test]
    async fn test_file_layout_uses_stream_keys() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).await.unwrap();
        store
            .save("signinattempts", CheckpointValue::Timestamp(ts(10, 0)))
            .await
            .unwrap();

        let raw = fs::read_to_string(dir.path().join(CONTEXT_FILE)).unwrap();
        let doc: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            doc["signinattempts"]["most_recent_date_seen"],
            Value::String(ts(10, 0).to_rfc3339())
        );
        assert_eq!(doc["signinattempts"]["generation"], Value::from(0));
    }

    #[tokio::test]
    async fn test_regression_is_refused_and_generation_counts_saves() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).await.unwrap();

        assert!(store.save("s", CheckpointValue::Offset(10)).await.unwrap());
        assert!(store.save("s", CheckpointValue::Offset(20)).await.unwrap());
        assert!(!store.save("s", CheckpointValue::Offset(15)).await.unwrap());

        let cp = store.load("s").await.unwrap();
        assert_eq!(cp.value, CheckpointValue::Offset(20));
        assert_eq!(cp.generation, 1);

        // Same value again is accepted without bumping the generation
        assert!(store.save("s", CheckpointValue::Offset(20)).await.unwrap());
        assert_eq!(store.load("s").await.unwrap().generation, 1);
    }

    #[tokio::test]
    async fn test_truncated_file_is_treated_as_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONTEXT_FILE), r#"{"signinattempts": {"most_rec"#).unwrap();

        let store = CheckpointStore::open(dir.path()).await.unwrap();
        assert!(store.load("signinattempts").await.is_none());

        // And a write replaces the broken file
        store.save("signinattempts", CheckpointValue::Offset(1)).await.unwrap();
        let reopened = CheckpointStore::open(dir.path()).await.unwrap();
        assert_eq!(
            reopened.load("signinattempts").await.unwrap().value,
            CheckpointValue::Offset(1)
        );
    }

    #[tokio::test]
    async fn test_legacy_scalar_values_are_understood() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONTEXT_FILE),
            r#"{"most_recent_date_seen": "2024-01-01T10:00:00+00:00", "most_recent_id_seen": 7}"#,
        )
        .unwrap();

        let store = CheckpointStore::open(dir.path()).await.unwrap();
        assert_eq!(
            store.load("most_recent_date_seen").await.unwrap().value,
            CheckpointValue::Timestamp(ts(10, 0))
        );
        assert_eq!(
            store.load("most_recent_id_seen").await.unwrap().value,
            CheckpointValue::Offset(7)
        );
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_value() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("module");
        let store = CheckpointStore::open(&data_dir).await.unwrap();
        store.save("s", CheckpointValue::Offset(1)).await.unwrap();

        fs::remove_dir_all(&data_dir).unwrap();
        let err = store.save("s", CheckpointValue::Offset(2)).await.unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }));
        assert_eq!(store.load("s").await.unwrap().value, CheckpointValue::Offset(1));
    }

    #[tokio::test]
    async fn test_dedup_records_are_stored_per_stream() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).await.unwrap();
        let records = vec![DedupRecord {
            fingerprint: "abc".into(),
            inserted_at: ts(9, 0),
        }];
        store.save_dedup("s1", &records).await.unwrap();

        let reopened = CheckpointStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.load_dedup("s1").await, records);
        assert!(reopened.load_dedup("s2").await.is_empty());
        // _dedup is not a stream
        assert!(reopened.load(DEDUP_KEY).await.is_none());
        assert!(matches!(
            reopened.save(DEDUP_KEY, CheckpointValue::Offset(1)).await,
            Err(StorageError::ReservedKey(_))
        ));
    }

    #[tokio::test]
    async fn test_with_lock_serializes_writers() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).await.unwrap();

        let first = store.lock("s").await;
        let contender = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .with_lock("s", |guard| async move {
                        guard.save(CheckpointValue::Offset(2)).await.unwrap()
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());
        first.save(CheckpointValue::Offset(1)).await.unwrap();
        drop(first);

        assert!(contender.await.unwrap());
        assert_eq!(store.load("s").await.unwrap().value, CheckpointValue::Offset(2));
    }
}
