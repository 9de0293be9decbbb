//! Generic fetch engine: priority fallback across sources, with a TTL cache.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::types::{DataSource, FetchResult, ProviderConfig};
use crate::cache::{default_key_fn, CacheEntry, KeyFn};

/// What a source is asked for.
pub struct SourceRequest<'a, P> {
  pub params: Option<&'a P>,
  /// Key the engine caches this request under
  pub cache_key: &'a str,
}

impl<P> Clone for SourceRequest<'_, P> {
  fn clone(&self) -> Self {
    *self
  }
}

impl<P> Copy for SourceRequest<'_, P> {}

/// The pluggable half of a provider: which sources exist and how to read one.
pub trait SourceProvider<P, T>: Send + Sync {
  /// Sources to register. Called once, when the engine is built.
  fn list_sources(&self) -> Vec<DataSource>;

  /// Fetch from one source.
  ///
  /// `Ok(None)` means the source had nothing; `Err` closes the source.
  fn fetch_from_source<'a>(
    &'a self,
    source: &'a DataSource,
    request: SourceRequest<'a, P>,
  ) -> BoxFuture<'a, Result<Option<T>>>;
}

/// Anything that answers `get`, used to nest providers.
pub trait Provider<P, T>: Send + Sync {
  fn fetch<'a>(&'a self, params: Option<&'a P>) -> BoxFuture<'a, FetchResult<T>>;

  fn sources_status(&self) -> Vec<DataSource>;
}

struct SourceState {
  source: DataSource,
  failures: u32,
  reopen_at: Option<DateTime<Utc>>,
}

/// Orchestrates attempts across the sources of a [`SourceProvider`].
///
/// `get` never fails: every error is recorded on its source, and when nothing
/// answers the caller gets cached data or an empty result with a diagnostic.
pub struct DataProvider<P, T, S> {
  inner: S,
  config: ProviderConfig,
  key_fn: KeyFn<P>,
  sources: Mutex<Vec<SourceState>>,
  cache: Mutex<HashMap<String, CacheEntry<T>>>,
}

impl<P, T, S> DataProvider<P, T, S>
where
  P: Serialize + Send + Sync + 'static,
  T: Clone + Send + Sync,
  S: SourceProvider<P, T>,
{
  pub fn new(inner: S, config: ProviderConfig) -> Self {
    let sources = inner
      .list_sources()
      .into_iter()
      .map(|source| SourceState {
        source,
        failures: 0,
        reopen_at: None,
      })
      .collect();

    Self {
      inner,
      config,
      key_fn: default_key_fn(),
      sources: Mutex::new(sources),
      cache: Mutex::new(HashMap::new()),
    }
  }

  /// Replace the cache key derivation.
  pub fn with_key_fn(mut self, key_fn: KeyFn<P>) -> Self {
    self.key_fn = key_fn;
    self
  }

  pub fn inner(&self) -> &S {
    &self.inner
  }

  pub fn config(&self) -> &ProviderConfig {
    &self.config
  }

  /// Fetch data for `params`, walking sources in priority order.
  ///
  /// 1. Try each available source, lowest priority first; cache and return
  ///    the first hit
  /// 2. If all sources fail, serve a cache entry younger than `cache_timeout`
  /// 3. Otherwise return an empty result describing what was attempted
  pub async fn get(&self, params: Option<&P>) -> FetchResult<T> {
    let key = (self.key_fn)(params);
    let candidates = self.candidates();
    let mut attempted = 0usize;

    for source in &candidates {
      if attempted > 0 && !self.config.fallback_enabled {
        break;
      }
      attempted += 1;

      let request = SourceRequest {
        params,
        cache_key: &key,
      };
      debug!(source = %source.id, key = %key, "Fetching from source");

      match self.attempt(source, request).await {
        Ok(Some(data)) => {
          self.lock_cache().insert(key.clone(), CacheEntry::new(data.clone()));
          let source = self.mark_success(&source.id).unwrap_or_else(|| source.clone());
          return FetchResult::fresh(data, source);
        }
        Ok(None) => {
          debug!(source = %source.id, "Source returned no data");
        }
        Err(e) => {
          warn!(source = %source.id, "Source failed: {}", e);
          self.mark_failed(&source.id, e.to_string());
        }
      }
    }

    if let Some(entry) = self.cached(&key) {
      debug!(key = %key, "Serving cached data after source exhaustion");
      return FetchResult::from_cache(entry.data, entry.timestamp);
    }

    self.exhausted(attempted, candidates.len())
  }

  /// Drop the cache entry for `params`.
  pub fn invalidate_cache(&self, params: Option<&P>) {
    let key = (self.key_fn)(params);
    self.lock_cache().remove(&key);
  }

  pub fn clear_cache(&self) {
    self.lock_cache().clear();
  }

  pub fn cache_len(&self) -> usize {
    self.lock_cache().len()
  }

  /// Open or close a source by id. Returns false for an unknown id.
  ///
  /// Opening resets the failure count and error; closing this way is never
  /// undone by the re-enable policy.
  pub fn update_source_status(&self, id: &str, available: bool) -> bool {
    let mut sources = self.lock_sources();
    let Some(state) = sources.iter_mut().find(|s| s.source.id == id) else {
      return false;
    };

    state.source.available = available;
    state.reopen_at = None;
    if available {
      state.failures = 0;
      state.source.error = None;
    }
    true
  }

  /// Snapshot of every registered source, available or not.
  pub fn sources_status(&self) -> Vec<DataSource> {
    self
      .lock_sources()
      .iter()
      .map(|s| s.source.clone())
      .collect()
  }

  /// Available sources in attempt order, after reopening any whose backoff
  /// has elapsed.
  fn candidates(&self) -> Vec<DataSource> {
    let now = Utc::now();
    let mut sources = self.lock_sources();

    for state in sources.iter_mut() {
      if let Some(reopen_at) = state.reopen_at {
        if now >= reopen_at {
          info!(source = %state.source.id, "Reopening source after backoff");
          state.source.available = true;
          state.reopen_at = None;
        }
      }
    }

    let mut open: Vec<DataSource> = sources
      .iter()
      .filter(|s| s.source.available)
      .map(|s| s.source.clone())
      .collect();
    // Stable, so equal priorities keep registration order
    open.sort_by_key(|s| s.priority);
    open
  }

  async fn attempt(&self, source: &DataSource, request: SourceRequest<'_, P>) -> Result<Option<T>> {
    let mut tries = 0;
    loop {
      match self.inner.fetch_from_source(source, request).await {
        Err(e) if tries < self.config.max_retries => {
          tries += 1;
          debug!(source = %source.id, attempt = tries, "Retrying source: {}", e);
        }
        outcome => return outcome,
      }
    }
  }

  fn mark_success(&self, id: &str) -> Option<DataSource> {
    let mut sources = self.lock_sources();
    let state = sources.iter_mut().find(|s| s.source.id == id)?;
    state.failures = 0;
    state.source.error = None;
    state.source.last_sync = Some(Utc::now());
    Some(state.source.clone())
  }

  fn mark_failed(&self, id: &str, error: String) {
    let mut sources = self.lock_sources();
    let Some(state) = sources.iter_mut().find(|s| s.source.id == id) else {
      return;
    };

    state.failures += 1;
    state.source.available = false;
    state.source.error = Some(error);
    state.reopen_at = self
      .config
      .reenable
      .reopen_delay(state.failures)
      .and_then(|delay| Utc::now().checked_add_signed(delay));

    match state.reopen_at {
      Some(at) => info!(source = %id, reopen_at = %at, "Source closed"),
      None => info!(source = %id, "Source closed until reopened manually"),
    }
  }

  /// Fresh cache entry for `key`; an expired one is evicted.
  fn cached(&self, key: &str) -> Option<CacheEntry<T>> {
    let mut cache = self.lock_cache();
    let expired = cache.get(key)?.is_expired(self.config.cache_timeout);
    if expired {
      cache.remove(key);
      return None;
    }
    cache.get(key).cloned()
  }

  fn exhausted(&self, attempted: usize, open: usize) -> FetchResult<T> {
    if !self.config.graceful_degradation {
      return FetchResult::empty(DataSource::failed(), "All data sources failed");
    }

    let message = if attempted == 0 {
      let registered = self.lock_sources().len();
      format!(
        "No data sources available ({} registered, {} open, 0 attempted)",
        registered, open
      )
    } else {
      format!("All {} attempted data sources failed", attempted)
    };
    FetchResult::empty(DataSource::degraded(), message)
  }

  fn lock_sources(&self) -> MutexGuard<'_, Vec<SourceState>> {
    self.sources.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn lock_cache(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<T>>> {
    self.cache.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl<P, T, S> Provider<P, T> for DataProvider<P, T, S>
where
  P: Serialize + Send + Sync + 'static,
  T: Clone + Send + Sync,
  S: SourceProvider<P, T>,
{
  fn fetch<'a>(&'a self, params: Option<&'a P>) -> BoxFuture<'a, FetchResult<T>> {
    Box::pin(self.get(params))
  }

  fn sources_status(&self) -> Vec<DataSource> {
    DataProvider::sources_status(self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::provider::types::{ReenablePolicy, SourceKind};
  use chrono::Duration;
  use color_eyre::eyre::eyre;
  use serde_json::{json, Value};
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  /// What a scripted source does on every call.
  #[derive(Clone)]
  enum Behaviour {
    Return(Value),
    Empty,
    Fail,
  }

  struct Scripted {
    sources: Vec<(DataSource, Behaviour)>,
    calls: Arc<Mutex<Vec<String>>>,
  }

  impl Scripted {
    fn new(sources: Vec<(DataSource, Behaviour)>) -> Self {
      Self {
        sources,
        calls: Arc::new(Mutex::new(Vec::new())),
      }
    }

    fn calls(&self) -> Vec<String> {
      self.calls.lock().unwrap().clone()
    }
  }

  impl SourceProvider<Value, Value> for Scripted {
    fn list_sources(&self) -> Vec<DataSource> {
      self.sources.iter().map(|(s, _)| s.clone()).collect()
    }

    fn fetch_from_source<'a>(
      &'a self,
      source: &'a DataSource,
      _request: SourceRequest<'a, Value>,
    ) -> BoxFuture<'a, Result<Option<Value>>> {
      self.calls.lock().unwrap().push(source.id.clone());
      let behaviour = self
        .sources
        .iter()
        .find(|(s, _)| s.id == source.id)
        .map(|(_, b)| b.clone());

      Box::pin(async move {
        match behaviour {
          Some(Behaviour::Return(v)) => Ok(Some(v)),
          Some(Behaviour::Empty) => Ok(None),
          Some(Behaviour::Fail) | None => Err(eyre!("{} is down", source.id)),
        }
      })
    }
  }

  fn api(id: &str, priority: i32) -> DataSource {
    DataSource::new(id, id.to_uppercase(), SourceKind::Api, priority)
  }

  fn never_reopen() -> ProviderConfig {
    ProviderConfig {
      reenable: ReenablePolicy::Never,
      ..ProviderConfig::default()
    }
  }

  fn status(provider: &DataProvider<Value, Value, Scripted>, id: &str) -> DataSource {
    provider
      .sources_status()
      .into_iter()
      .find(|s| s.id == id)
      .unwrap()
  }

  #[tokio::test]
  async fn test_falls_back_to_next_priority() {
    // Registered out of order to check sorting
    let scripted = Scripted::new(vec![
      (api("b", 2), Behaviour::Return(json!({"x": 1}))),
      (api("a", 1), Behaviour::Fail),
      (api("c", 3), Behaviour::Return(json!({"x": 3}))),
    ]);
    let provider = DataProvider::new(scripted, never_reopen());

    let result = provider.get(None).await;

    assert_eq!(result.data, Some(json!({"x": 1})));
    assert_eq!(result.source.id, "b");
    assert!(!result.cached);
    assert!(result.error.is_none());
    assert!(result.source.last_sync.is_some());

    let a = status(&provider, "a");
    assert!(!a.available);
    assert_eq!(a.error.as_deref(), Some("a is down"));

    // "c" is never invoked
    assert_eq!(provider.inner().calls(), vec!["a", "b"]);
  }

  #[tokio::test]
  async fn test_never_fails_without_cache() {
    let scripted = Scripted::new(vec![(api("a", 1), Behaviour::Fail), (api("b", 2), Behaviour::Fail)]);
    let provider = DataProvider::new(scripted, never_reopen());

    let result = provider.get(Some(&json!({"page": 1}))).await;

    assert!(result.data.is_none());
    assert_eq!(result.source.id, "degraded");
    assert_eq!(result.source.priority, 100);
    assert_eq!(result.error.as_deref(), Some("All 2 attempted data sources failed"));

    // Both closed; a second call attempts nothing
    let again = provider.get(Some(&json!({"page": 1}))).await;
    assert_eq!(
      again.error.as_deref(),
      Some("No data sources available (2 registered, 0 open, 0 attempted)")
    );
  }

  #[tokio::test]
  async fn test_without_degradation() {
    let scripted = Scripted::new(vec![(api("a", 1), Behaviour::Fail)]);
    let config = ProviderConfig {
      graceful_degradation: false,
      ..never_reopen()
    };
    let provider = DataProvider::new(scripted, config);

    let result = provider.get(None).await;

    assert!(result.data.is_none());
    assert_eq!(result.source.id, "error");
    assert_eq!(result.error.as_deref(), Some("All data sources failed"));
  }

  #[tokio::test]
  async fn test_serves_cache_once_source_is_closed() {
    let scripted = Scripted::new(vec![(api("a", 1), Behaviour::Return(json!([1, 2])))]);
    let provider = DataProvider::new(scripted, never_reopen());
    let params = json!({"q": "rust"});

    let first = provider.get(Some(&params)).await;
    assert!(!first.cached);

    provider.update_source_status("a", false);
    let second = provider.get(Some(&params)).await;

    assert_eq!(second.data, first.data);
    assert!(second.cached);
    assert_eq!(second.source.id, "cache");
    assert_eq!(second.source.kind, SourceKind::Cache);
    assert_eq!(second.source.priority, 0);
  }

  #[tokio::test]
  async fn test_expired_cache_is_not_served() {
    let scripted = Scripted::new(vec![(api("a", 1), Behaviour::Return(json!("v")))]);
    let config = ProviderConfig {
      cache_timeout: Duration::milliseconds(20),
      ..never_reopen()
    };
    let provider = DataProvider::new(scripted, config);

    provider.get(None).await;
    assert_eq!(provider.cache_len(), 1);

    provider.update_source_status("a", false);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let result = provider.get(None).await;
    assert!(result.data.is_none());
    assert_eq!(result.source.id, "degraded");
    // Lazily evicted on that read
    assert_eq!(provider.cache_len(), 0);
  }

  #[tokio::test]
  async fn test_empty_source_is_a_miss_not_a_failure() {
    let scripted = Scripted::new(vec![
      (api("a", 1), Behaviour::Empty),
      (api("b", 2), Behaviour::Return(json!(7))),
    ]);
    let provider = DataProvider::new(scripted, never_reopen());

    let result = provider.get(None).await;

    assert_eq!(result.data, Some(json!(7)));
    assert!(status(&provider, "a").available);
  }

  #[tokio::test]
  async fn test_fallback_disabled_stops_after_first_source() {
    let scripted = Scripted::new(vec![
      (api("a", 1), Behaviour::Fail),
      (api("b", 2), Behaviour::Return(json!(1))),
    ]);
    let config = ProviderConfig {
      fallback_enabled: false,
      ..never_reopen()
    };
    let provider = DataProvider::new(scripted, config);

    let result = provider.get(None).await;

    assert!(result.data.is_none());
    assert_eq!(provider.inner().calls(), vec!["a"]);
  }

  #[tokio::test]
  async fn test_unavailable_sources_are_skipped_but_listed() {
    let scripted = Scripted::new(vec![
      (api("a", 1).unavailable(), Behaviour::Return(json!(1))),
      (api("b", 2), Behaviour::Return(json!(2))),
    ]);
    let provider = DataProvider::new(scripted, never_reopen());

    let result = provider.get(None).await;

    assert_eq!(result.source.id, "b");
    assert_eq!(provider.sources_status().len(), 2);
    assert!(provider.update_source_status("a", true));
    assert!(!provider.update_source_status("missing", true));
    assert_eq!(provider.get(None).await.source.id, "a");
  }

  #[tokio::test]
  async fn test_manual_reopen_clears_error() {
    let scripted = Scripted::new(vec![(api("a", 1), Behaviour::Fail)]);
    let provider = DataProvider::new(scripted, never_reopen());

    provider.get(None).await;
    assert!(status(&provider, "a").error.is_some());

    provider.update_source_status("a", true);
    let a = status(&provider, "a");
    assert!(a.available);
    assert!(a.error.is_none());
  }

  #[tokio::test]
  async fn test_backoff_reopens_source() {
    let scripted = Scripted::new(vec![(api("a", 1), Behaviour::Fail)]);
    let config = ProviderConfig {
      reenable: ReenablePolicy::Backoff {
        base: Duration::milliseconds(20),
        max: Duration::seconds(1),
      },
      ..ProviderConfig::default()
    };
    let provider = DataProvider::new(scripted, config);

    provider.get(None).await;
    assert!(!status(&provider, "a").available);

    // Still closed right away
    provider.get(None).await;
    assert_eq!(provider.inner().calls().len(), 1);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    provider.get(None).await;
    assert_eq!(provider.inner().calls().len(), 2);
  }

  #[tokio::test]
  async fn test_retries_before_closing() {
    let scripted = Scripted::new(vec![(api("a", 1), Behaviour::Fail)]);
    let config = ProviderConfig {
      max_retries: 2,
      ..never_reopen()
    };
    let provider = DataProvider::new(scripted, config);

    provider.get(None).await;

    assert_eq!(provider.inner().calls().len(), 3);
    assert!(!status(&provider, "a").available);
  }

  #[tokio::test]
  async fn test_invalidate_and_clear() {
    let scripted = Scripted::new(vec![(api("a", 1), Behaviour::Return(json!(1)))]);
    let provider = DataProvider::new(scripted, never_reopen());
    let one = json!({"page": 1});
    let two = json!({"page": 2});

    provider.get(Some(&one)).await;
    provider.get(Some(&two)).await;
    assert_eq!(provider.cache_len(), 2);

    provider.invalidate_cache(Some(&one));
    assert_eq!(provider.cache_len(), 1);

    provider.clear_cache();
    assert_eq!(provider.cache_len(), 0);
  }

  #[tokio::test]
  async fn test_custom_key_fn() {
    let scripted = Scripted::new(vec![(api("a", 1), Behaviour::Return(json!(1)))]);
    let counter = Arc::new(AtomicU32::new(0));
    let seen = counter.clone();
    let provider = DataProvider::new(scripted, never_reopen()).with_key_fn(Arc::new(move |_: Option<&Value>| {
      seen.fetch_add(1, Ordering::SeqCst);
      "constant".to_string()
    }));

    provider.get(Some(&json!({"page": 1}))).await;
    provider.get(Some(&json!({"page": 2}))).await;

    assert_eq!(provider.cache_len(), 1);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
  }
}
