//! Cache key derivation and the in-memory cache entry type.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::warn;

/// Derives the cache key for a request's params.
///
/// Must be deterministic: equal params always map to the same key.
pub type KeyFn<P> = Arc<dyn Fn(Option<&P>) -> String + Send + Sync>;

/// Default key derivation: JSON with object keys sorted at every level.
///
/// Absent params encode as `{}`, so `get(None)` and `get(Some(&empty))`
/// share one entry.
pub fn stable_key<P: Serialize>(params: Option<&P>) -> String {
  let Some(params) = params else {
    return "{}".to_string();
  };

  match serde_json::to_value(params) {
    Ok(value) => canonicalize(value).to_string(),
    Err(e) => {
      warn!("Params are not JSON-encodable, using empty key: {}", e);
      "{}".to_string()
    }
  }
}

/// Like [`stable_key`], hashed to a fixed-length hex string.
pub fn hashed_key<P: Serialize>(params: Option<&P>) -> String {
  let mut hasher = Sha256::new();
  hasher.update(stable_key(params).as_bytes());
  hex::encode(hasher.finalize())
}

/// The default [`KeyFn`], built on [`stable_key`].
pub fn default_key_fn<P: Serialize + 'static>() -> KeyFn<P> {
  Arc::new(|params: Option<&P>| stable_key(params))
}

// Rebuild objects in sorted key order so the encoding does not depend on
// whether serde_json keeps insertion order.
fn canonicalize(value: Value) -> Value {
  match value {
    Value::Object(map) => {
      let mut entries: Vec<(String, Value)> = map.into_iter().collect();
      entries.sort_by(|a, b| a.0.cmp(&b.0));

      let mut sorted = Map::new();
      for (k, v) in entries {
        sorted.insert(k, canonicalize(v));
      }
      Value::Object(sorted)
    }
    Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
    other => other,
  }
}

/// A cached fetch result.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  pub data: T,
  pub timestamp: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
  pub fn new(data: T) -> Self {
    Self {
      data,
      timestamp: Utc::now(),
    }
  }

  /// Whether the entry is older than `timeout`.
  pub fn is_expired(&self, timeout: Duration) -> bool {
    Utc::now() - self.timestamp > timeout
  }
}
