//! Offline-first persistence: a durable value cache and an ordered queue of
//! writes that are replayed when connectivity returns.

mod connectivity;
mod manager;

use chrono::{DateTime, Utc};
use color_eyre::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use connectivity::Connectivity;
pub use manager::{OfflineDataManager, SubmitOutcome, OFFLINE_CACHE_KEY, SYNC_QUEUE_KEY};

/// A write captured while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
  pub key: String,
  pub data: Value,
  pub timestamp: DateTime<Utc>,
}

impl SyncQueueItem {
  pub fn new(key: impl Into<String>, data: Value) -> Self {
    Self {
      key: key.into(),
      data,
      timestamp: Utc::now(),
    }
  }
}

/// Delivers one queued write to its destination.
pub trait SyncHandler: Send + Sync {
  fn sync<'a>(&'a self, item: &'a SyncQueueItem) -> BoxFuture<'a, Result<()>>;
}
