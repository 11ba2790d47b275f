pub mod cache;

pub use cache::{load_persisted, DedupCache};
