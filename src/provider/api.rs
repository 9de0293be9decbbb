//! Remote-fetch provider: primary endpoint, fallback endpoint, local storage.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::engine::{DataProvider, SourceProvider, SourceRequest};
use super::types::{DataSource, SourceKind};
use crate::cache::KeyValueStore;

pub const PRIMARY_API: &str = "primary-api";
pub const FALLBACK_API: &str = "fallback-api";
pub const LOCAL_STORAGE: &str = "local-storage";

/// Performs one remote call. `Ok(None)` means the remote had no data.
pub type Fetcher<P, T> = Arc<dyn Fn(Option<P>) -> BoxFuture<'static, Result<Option<T>>> + Send + Sync>;

/// Wrap an async closure as a [`Fetcher`].
pub fn fetcher<P, T, F, Fut>(f: F) -> Fetcher<P, T>
where
  P: 'static,
  T: 'static,
  F: Fn(Option<P>) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Option<T>>> + Send + 'static,
{
  Arc::new(move |params| Box::pin(f(params)))
}

/// Storage key for a local-source entry.
pub fn local_key(source_id: &str, cache_key: &str) -> String {
  format!("data_provider_{}_{}", source_id, cache_key)
}

/// Source chain for a single remote resource.
pub struct ApiSources<P, T> {
  primary: Fetcher<P, T>,
  fallback: Option<Fetcher<P, T>>,
  store: Option<Arc<dyn KeyValueStore>>,
}

/// [`DataProvider`] over [`ApiSources`].
pub type ApiDataProvider<P, T> = DataProvider<P, T, ApiSources<P, T>>;

impl<P, T> ApiSources<P, T> {
  pub fn new(primary: Fetcher<P, T>) -> Self {
    Self {
      primary,
      fallback: None,
      store: None,
    }
  }

  /// Use a distinct fetcher for `fallback-api`. Without one the primary
  /// fetcher is reused.
  pub fn with_fallback(mut self, fallback: Fetcher<P, T>) -> Self {
    self.fallback = Some(fallback);
    self
  }

  /// Enable the `local-storage` source.
  pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
    self.store = Some(store);
    self
  }
}

impl<P, T> ApiSources<P, T>
where
  T: Serialize + DeserializeOwned,
{
  /// Keep a copy of a remote result for the local source.
  fn mirror(&self, cache_key: &str, data: &T) {
    let Some(store) = &self.store else {
      return;
    };

    let stored = serde_json::to_string(data)
      .map_err(|e| eyre!("Failed to serialize data: {}", e))
      .and_then(|json| store.set(&local_key(LOCAL_STORAGE, cache_key), &json));

    if let Err(e) = stored {
      warn!("Failed to mirror result to local storage: {}", e);
    }
  }

  /// Read a local entry. Anything unreadable is a miss.
  fn read_local(&self, source_id: &str, cache_key: &str) -> Result<Option<T>> {
    let Some(store) = &self.store else {
      return Ok(None);
    };

    let key = local_key(source_id, cache_key);
    let Some(raw) = store.get(&key)? else {
      return Ok(None);
    };

    match serde_json::from_str(&raw) {
      Ok(data) => Ok(Some(data)),
      Err(e) => {
        warn!(key = %key, "Ignoring unreadable local entry: {}", e);
        Ok(None)
      }
    }
  }
}

impl<P, T> SourceProvider<P, T> for ApiSources<P, T>
where
  P: Clone + Send + Sync,
  T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
  fn list_sources(&self) -> Vec<DataSource> {
    let local = DataSource::new(LOCAL_STORAGE, "Local storage", SourceKind::Local, 3);

    vec![
      DataSource::new(PRIMARY_API, "Primary API", SourceKind::Api, 1),
      DataSource::new(FALLBACK_API, "Fallback API", SourceKind::Api, 2),
      if self.store.is_some() {
        local
      } else {
        local.unavailable()
      },
    ]
  }

  fn fetch_from_source<'a>(
    &'a self,
    source: &'a DataSource,
    request: SourceRequest<'a, P>,
  ) -> BoxFuture<'a, Result<Option<T>>> {
    Box::pin(async move {
      match source.kind {
        SourceKind::Api => {
          let fetch = match (source.id.as_str(), &self.fallback) {
            (FALLBACK_API, Some(fallback)) => fallback,
            _ => &self.primary,
          };

          let data = fetch(request.params.cloned()).await?;
          if let Some(data) = &data {
            self.mirror(request.cache_key, data);
          }
          Ok(data)
        }
        SourceKind::Local => {
          debug!(source = %source.id, "Reading local storage");
          self.read_local(&source.id, request.cache_key)
        }
        kind => Err(eyre!("Unsupported source kind {:?} for {}", kind, source.id)),
      }
    })
  }
}
