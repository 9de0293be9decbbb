use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Connectivity, SyncHandler, SyncQueueItem};
use crate::cache::KeyValueStore;

pub const OFFLINE_CACHE_KEY: &str = "offline_data_cache";
pub const SYNC_QUEUE_KEY: &str = "sync_queue";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedValue {
  data: Value,
  timestamp: DateTime<Utc>,
}

type CacheObject = BTreeMap<String, CachedValue>;

/// What happened to a submitted write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
  /// Delivered immediately
  Synced,
  /// Stored in the sync queue for the next reconnect
  Queued,
}

/// Durable value cache plus an ordered queue of pending writes.
///
/// Build one per process and share it through `Arc`. The value cache is read
/// and written through the store on every call; the queue lives in memory and
/// is persisted by [`save_sync_queue`](Self::save_sync_queue) and after every
/// drain.
pub struct OfflineDataManager {
  store: Arc<dyn KeyValueStore>,
  handler: Arc<dyn SyncHandler>,
  default_max_age: Duration,
  online: AtomicBool,
  queue: Mutex<VecDeque<SyncQueueItem>>,
  /// Serializes drains so replay order matches queue order
  drain: tokio::sync::Mutex<()>,
  listener: Mutex<Option<watch::Receiver<bool>>>,
}

impl OfflineDataManager {
  /// Capture the current connectivity, subscribe to its transitions and
  /// restore any queue persisted by a previous run.
  pub fn new(
    store: Arc<dyn KeyValueStore>,
    connectivity: &Connectivity,
    handler: Arc<dyn SyncHandler>,
  ) -> Result<Self> {
    let queue = load_queue(store.as_ref())?;
    if !queue.is_empty() {
      info!(pending = queue.len(), "Restored sync queue");
    }

    Ok(Self {
      store,
      handler,
      default_max_age: Duration::hours(24),
      online: AtomicBool::new(connectivity.is_online()),
      queue: Mutex::new(queue),
      drain: tokio::sync::Mutex::new(()),
      listener: Mutex::new(Some(connectivity.subscribe())),
    })
  }

  /// Max age used by `get_cached_data` when the caller passes none.
  pub fn with_default_max_age(mut self, max_age: Duration) -> Self {
    self.default_max_age = max_age;
    self
  }

  /// Run the online/offline handlers on every connectivity transition.
  ///
  /// Can be called once; the task ends when every `Connectivity` clone is
  /// dropped.
  pub fn spawn_listener(self: &Arc<Self>) -> Result<JoinHandle<()>> {
    let mut rx = self
      .listener
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .take()
      .ok_or_else(|| eyre!("Connectivity listener already running"))?;

    let manager = Arc::clone(self);
    Ok(tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        if online {
          manager.set_online_flag(true);
          // Drain on its own task so a later offline transition is seen mid-drain
          let drainer = Arc::clone(&manager);
          tokio::spawn(async move {
            if let Err(e) = drainer.flush_sync_queue().await {
              warn!("Failed to flush sync queue: {}", e);
            }
          });
        } else {
          manager.handle_offline();
        }
      }
    }))
  }

  pub fn is_currently_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// Store a value in the durable cache.
  pub fn cache_data<T: Serialize>(&self, key: &str, data: &T) -> Result<()> {
    let data = serde_json::to_value(data).map_err(|e| eyre!("Failed to serialize data: {}", e))?;

    let mut cache = self.load_cache()?;
    cache.insert(
      key.to_string(),
      CachedValue {
        data,
        timestamp: Utc::now(),
      },
    );
    self.save_cache(&cache)
  }

  /// Read a cached value no older than `max_age` (default when `None`).
  ///
  /// An expired entry is removed from the store. An entry that does not
  /// decode as `T` is a miss.
  pub fn get_cached_data<T: DeserializeOwned>(
    &self,
    key: &str,
    max_age: Option<Duration>,
  ) -> Result<Option<T>> {
    let max_age = max_age.unwrap_or(self.default_max_age);
    let mut cache = self.load_cache()?;

    let Some(entry) = cache.get(key) else {
      return Ok(None);
    };

    if Utc::now() - entry.timestamp > max_age {
      debug!(key = %key, "Evicting expired offline cache entry");
      cache.remove(key);
      self.save_cache(&cache)?;
      return Ok(None);
    }

    match serde_json::from_value(entry.data.clone()) {
      Ok(data) => Ok(Some(data)),
      Err(e) => {
        warn!(key = %key, "Cached value has unexpected shape: {}", e);
        Ok(None)
      }
    }
  }

  pub fn cache_size(&self) -> Result<usize> {
    Ok(self.load_cache()?.len())
  }

  pub fn clear_cache(&self) -> Result<()> {
    self.store.remove(OFFLINE_CACHE_KEY)
  }

  /// Append a write to the queue.
  ///
  /// Writes are not merged by key, and nothing is persisted until
  /// [`save_sync_queue`](Self::save_sync_queue).
  pub fn queue_for_sync<T: Serialize>(&self, key: &str, data: &T) -> Result<()> {
    let data = serde_json::to_value(data).map_err(|e| eyre!("Failed to serialize data: {}", e))?;
    self.lock_queue().push_back(SyncQueueItem::new(key, data));
    Ok(())
  }

  /// Deliver a write now if possible, otherwise queue and persist it.
  ///
  /// While older writes are still pending the new one is queued behind them
  /// so delivery order is preserved.
  pub async fn submit<T: Serialize>(&self, key: &str, data: &T) -> Result<SubmitOutcome> {
    let data = serde_json::to_value(data).map_err(|e| eyre!("Failed to serialize data: {}", e))?;
    let item = SyncQueueItem::new(key, data);

    if self.is_currently_online() {
      // A running drain may hold the last pending item outside the queue
      let _drain = self.drain.lock().await;
      if self.is_currently_online() && self.sync_queue_size() == 0 {
        match self.handler.sync(&item).await {
          Ok(()) => return Ok(SubmitOutcome::Synced),
          Err(e) => warn!(key = %item.key, "Direct sync failed, queueing: {}", e),
        }
      }

      self.lock_queue().push_back(item);
      self.save_sync_queue()?;
      return Ok(SubmitOutcome::Queued);
    }

    self.lock_queue().push_back(item);
    self.save_sync_queue()?;
    Ok(SubmitOutcome::Queued)
  }

  pub fn sync_queue_size(&self) -> usize {
    self.lock_queue().len()
  }

  /// Snapshot of pending writes in replay order.
  pub fn pending(&self) -> Vec<SyncQueueItem> {
    self.lock_queue().iter().cloned().collect()
  }

  /// Persist the current queue.
  pub fn save_sync_queue(&self) -> Result<()> {
    let items = self.pending();
    let json =
      serde_json::to_string(&items).map_err(|e| eyre!("Failed to serialize sync queue: {}", e))?;
    self.store.set(SYNC_QUEUE_KEY, &json)
  }

  /// Switch to online and replay the queue.
  pub async fn handle_online(&self) {
    self.set_online_flag(true);

    if let Err(e) = self.flush_sync_queue().await {
      warn!("Failed to flush sync queue: {}", e);
    }
  }

  /// Switch to offline. Pending writes stay queued.
  pub fn handle_offline(&self) {
    self.set_online_flag(false);
  }

  fn set_online_flag(&self, online: bool) {
    if online {
      info!("Connectivity restored");
    } else {
      info!("Connectivity lost");
    }
    self.online.store(online, Ordering::SeqCst);
  }

  /// Replay queued writes oldest first, one at a time.
  ///
  /// Stops at the first failure, leaving that item at the head. Also stops
  /// if connectivity is lost mid-drain. The remaining queue is persisted.
  /// Returns how many items were delivered.
  pub async fn flush_sync_queue(&self) -> Result<usize> {
    let _drain = self.drain.lock().await;
    let mut synced = 0;

    while self.is_currently_online() {
      let Some(item) = self.pop_next() else {
        break;
      };

      match self.handler.sync(&item).await {
        Ok(()) => {
          debug!(key = %item.key, "Synced queued write");
          synced += 1;
        }
        Err(e) => {
          warn!(key = %item.key, "Sync failed, will retry on reconnect: {}", e);
          self.lock_queue().push_front(item);
          break;
        }
      }
    }

    if synced > 0 {
      info!(synced, remaining = self.sync_queue_size(), "Drained sync queue");
    }
    self.save_sync_queue()?;
    Ok(synced)
  }

  fn pop_next(&self) -> Option<SyncQueueItem> {
    self.lock_queue().pop_front()
  }

  fn load_cache(&self) -> Result<CacheObject> {
    let Some(raw) = self.store.get(OFFLINE_CACHE_KEY)? else {
      return Ok(CacheObject::new());
    };

    match serde_json::from_str(&raw) {
      Ok(cache) => Ok(cache),
      Err(e) => {
        warn!("Discarding unreadable offline cache: {}", e);
        Ok(CacheObject::new())
      }
    }
  }

  fn save_cache(&self, cache: &CacheObject) -> Result<()> {
    let json =
      serde_json::to_string(cache).map_err(|e| eyre!("Failed to serialize offline cache: {}", e))?;
    self.store.set(OFFLINE_CACHE_KEY, &json)
  }

  fn lock_queue(&self) -> MutexGuard<'_, VecDeque<SyncQueueItem>> {
    self.queue.lock().unwrap_or_else(|e| e.into_inner())
  }
}

fn load_queue(store: &dyn KeyValueStore) -> Result<VecDeque<SyncQueueItem>> {
  let Some(raw) = store.get(SYNC_QUEUE_KEY)? else {
    return Ok(VecDeque::new());
  };

  match serde_json::from_str::<Vec<SyncQueueItem>>(&raw) {
    Ok(items) => Ok(items.into()),
    Err(e) => {
      warn!("Discarding unreadable sync queue: {}", e);
      Ok(VecDeque::new())
    }
  }
}
