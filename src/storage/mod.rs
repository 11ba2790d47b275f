pub mod checkpoint;

pub use checkpoint::{
    Checkpoint, CheckpointStore, CheckpointValue, DedupRecord, StorageError, StreamGuard,
    DEDUP_KEY,
};
