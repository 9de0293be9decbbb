//! Cache keys and persistent storage.
//!
//! - Deterministic key derivation for request params
//! - The timestamped entry kept by provider caches
//! - A string key-value store trait with SQLite and in-memory backends

mod key;
mod storage;

pub use key::{default_key_fn, hashed_key, stable_key, CacheEntry, KeyFn};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
