//! Source, result and configuration types shared by every provider.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// What kind of origin a source is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
  /// Remote endpoint
  Api,
  /// Persistent local storage
  Local,
  /// In-memory provider cache
  Cache,
  /// Synthesized result, no real origin
  Fallback,
}

/// One origin a provider can fetch from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataSource {
  pub id: String,
  pub name: String,
  pub kind: SourceKind,
  /// Lower is tried first
  pub priority: i32,
  pub available: bool,
  pub last_sync: Option<DateTime<Utc>>,
  pub error: Option<String>,
}

impl DataSource {
  pub fn new(id: impl Into<String>, name: impl Into<String>, kind: SourceKind, priority: i32) -> Self {
    Self {
      id: id.into(),
      name: name.into(),
      kind,
      priority,
      available: true,
      last_sync: None,
      error: None,
    }
  }

  /// Register the source closed.
  pub fn unavailable(mut self) -> Self {
    self.available = false;
    self
  }

  /// Marker source for results served from the provider cache.
  pub fn cache() -> Self {
    Self::new("cache", "Cache", SourceKind::Cache, 0)
  }

  /// Marker source for graceful-degradation results.
  pub fn degraded() -> Self {
    Self::new("degraded", "Degraded", SourceKind::Fallback, 100)
  }

  /// Marker source for hard failures.
  pub fn failed() -> Self {
    Self::new("error", "Error", SourceKind::Fallback, 100)
  }
}

/// Outcome of `DataProvider::get`.
///
/// `data` is `None` only together with an `error`, and `cached` is only set
/// when `source` is the cache marker.
#[derive(Debug, Clone, Serialize)]
pub struct FetchResult<T> {
  pub data: Option<T>,
  pub source: DataSource,
  pub timestamp: DateTime<Utc>,
  pub cached: bool,
  pub error: Option<String>,
}

impl<T> FetchResult<T> {
  /// Fresh data from a real source.
  pub fn fresh(data: T, source: DataSource) -> Self {
    Self {
      data: Some(data),
      source,
      timestamp: Utc::now(),
      cached: false,
      error: None,
    }
  }

  /// Data served from the provider cache.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data: Some(data),
      source: DataSource::cache(),
      timestamp: cached_at,
      cached: true,
      error: None,
    }
  }

  /// Empty result carrying a diagnostic.
  pub fn empty(source: DataSource, error: impl Into<String>) -> Self {
    Self {
      data: None,
      source,
      timestamp: Utc::now(),
      cached: false,
      error: Some(error.into()),
    }
  }

  pub fn is_degraded(&self) -> bool {
    self.data.is_none()
  }
}

/// When a source closed by a failure may be tried again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReenablePolicy {
  /// Stays closed until `update_source_status` reopens it
  Never,
  /// Reopens after `base * 2^(failures - 1)`, capped at `max`
  Backoff { base: Duration, max: Duration },
}

impl ReenablePolicy {
  /// Delay before reopening after the given consecutive failure count.
  pub fn reopen_delay(&self, failures: u32) -> Option<Duration> {
    match *self {
      ReenablePolicy::Never => None,
      ReenablePolicy::Backoff { base, max } => {
        let exponent = failures.saturating_sub(1).min(20);
        let delay = base.checked_mul(1i32 << exponent).unwrap_or(max);
        Some(delay.min(max))
      }
    }
  }
}

impl Default for ReenablePolicy {
  fn default() -> Self {
    ReenablePolicy::Backoff {
      base: Duration::seconds(30),
      max: Duration::minutes(10),
    }
  }
}

/// Per-provider behaviour, fixed at construction.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
  /// Extra attempts on the same source before it is closed
  pub max_retries: u32,
  /// How long a cached result may be served after every source failed
  pub cache_timeout: Duration,
  /// Whether sources after the first available one are tried
  pub fallback_enabled: bool,
  /// Return an empty result instead of a hard failure marker
  pub graceful_degradation: bool,
  pub reenable: ReenablePolicy,
}

impl Default for ProviderConfig {
  fn default() -> Self {
    Self {
      max_retries: 0,
      cache_timeout: Duration::minutes(5),
      fallback_enabled: true,
      graceful_degradation: true,
      reenable: ReenablePolicy::default(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_backoff_doubles_and_caps() {
    let policy = ReenablePolicy::Backoff {
      base: Duration::seconds(10),
      max: Duration::seconds(60),
    };

    assert_eq!(policy.reopen_delay(1), Some(Duration::seconds(10)));
    assert_eq!(policy.reopen_delay(2), Some(Duration::seconds(20)));
    assert_eq!(policy.reopen_delay(3), Some(Duration::seconds(40)));
    assert_eq!(policy.reopen_delay(4), Some(Duration::seconds(60)));
    assert_eq!(policy.reopen_delay(40), Some(Duration::seconds(60)));
  }

  #[test]
  fn test_never_policy() {
    assert_eq!(ReenablePolicy::Never.reopen_delay(1), None);
  }

  #[test]
  fn test_empty_result_carries_error() {
    let result: FetchResult<u32> = FetchResult::empty(DataSource::degraded(), "nothing");
    assert!(result.is_degraded());
    assert_eq!(result.error.as_deref(), Some("nothing"));
    assert!(!result.cached);
  }
}
