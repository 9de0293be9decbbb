use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::provider::{ProviderConfig, ReenablePolicy};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub provider: ProviderSettings,
  #[serde(default)]
  pub offline: OfflineSettings,
  /// Named remote resources that `fetch` can target
  #[serde(default)]
  pub endpoints: BTreeMap<String, EndpointConfig>,
  /// Where queued writes are replayed to
  pub sync: Option<SyncConfig>,
  #[serde(default)]
  pub http: HttpSettings,
  #[serde(default)]
  pub log: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
  pub max_retries: u32,
  pub cache_timeout_secs: u64,
  pub fallback_enabled: bool,
  pub graceful_degradation: bool,
  pub reenable: ReenableSetting,
}

impl Default for ProviderSettings {
  fn default() -> Self {
    Self {
      max_retries: 0,
      cache_timeout_secs: 300,
      fallback_enabled: true,
      graceful_degradation: true,
      reenable: ReenableSetting::default(),
    }
  }
}

/// How closed sources come back.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ReenableSetting {
  /// Only a manual status update reopens a source
  Never,
  /// Exponential backoff between `base_secs` and `max_secs`
  Backoff { base_secs: u64, max_secs: u64 },
}

impl Default for ReenableSetting {
  fn default() -> Self {
    ReenableSetting::Backoff {
      base_secs: 30,
      max_secs: 600,
    }
  }
}

impl From<&ProviderSettings> for ProviderConfig {
  fn from(settings: &ProviderSettings) -> Self {
    let reenable = match settings.reenable {
      ReenableSetting::Never => ReenablePolicy::Never,
      ReenableSetting::Backoff {
        base_secs,
        max_secs,
      } => ReenablePolicy::Backoff {
        base: seconds(base_secs),
        max: seconds(max_secs),
      },
    };

    ProviderConfig {
      max_retries: settings.max_retries,
      cache_timeout: seconds(settings.cache_timeout_secs),
      fallback_enabled: settings.fallback_enabled,
      graceful_degradation: settings.graceful_degradation,
      reenable,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineSettings {
  /// Max age for offline cache reads that do not pass one
  pub default_max_age_secs: u64,
}

impl Default for OfflineSettings {
  fn default() -> Self {
    Self {
      default_max_age_secs: 24 * 60 * 60,
    }
  }
}

impl OfflineSettings {
  pub fn default_max_age(&self) -> chrono::Duration {
    seconds(self.default_max_age_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
  pub primary: String,
  /// Mirror tried after the primary fails
  pub fallback: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
  pub timeout_secs: u64,
}

impl Default for HttpSettings {
  fn default() -> Self {
    Self { timeout_secs: 30 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
  /// `tracing_subscriber::EnvFilter` directive, overridden by `STRATA_LOG`
  pub filter: String,
}

impl Default for LogSettings {
  fn default() -> Self {
    Self {
      filter: "info".to_string(),
    }
  }
}

// Configured durations are clamped to ten years
const MAX_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn seconds(secs: u64) -> chrono::Duration {
  chrono::Duration::seconds(secs.min(MAX_SECS) as i64)
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./strata.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/strata/config.yaml
  ///
  /// Without any file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("strata.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("strata").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  pub fn endpoint(&self, name: &str) -> Result<&EndpointConfig> {
    self.endpoints.get(name).ok_or_else(|| {
      let known: Vec<&str> = self.endpoints.keys().map(String::as_str).collect();
      eyre!("Unknown endpoint '{}'. Configured: {}", name, known.join(", "))
    })
  }
}

/// Directory for the store and log files.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("strata"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_config_uses_defaults() {
    let config = Config::parse("{}").unwrap();

    assert!(config.endpoints.is_empty());
    assert!(config.sync.is_none());
    assert_eq!(config.http.timeout_secs, 30);
    assert_eq!(config.log.filter, "info");

    let provider = ProviderConfig::from(&config.provider);
    assert_eq!(provider.cache_timeout, chrono::Duration::minutes(5));
    assert_eq!(provider.reenable, ReenablePolicy::default());
  }

  #[test]
  fn test_full_config() {
    let config = Config::parse(
      r#"
provider:
  max_retries: 2
  cache_timeout_secs: 60
  fallback_enabled: false
  reenable:
    mode: never
offline:
  default_max_age_secs: 3600
endpoints:
  papers:
    primary: https://api.example.com/papers
    fallback: https://mirror.example.com/papers
  jobs:
    primary: https://api.example.com/jobs
sync:
  url: https://api.example.com/sync
"#,
    )
    .unwrap();

    let provider = ProviderConfig::from(&config.provider);
    assert_eq!(provider.max_retries, 2);
    assert_eq!(provider.cache_timeout, chrono::Duration::seconds(60));
    assert!(!provider.fallback_enabled);
    assert!(provider.graceful_degradation);
    assert_eq!(provider.reenable, ReenablePolicy::Never);
    assert_eq!(config.offline.default_max_age(), chrono::Duration::hours(1));

    assert!(config.endpoint("papers").unwrap().fallback.is_some());
    assert!(config.endpoint("jobs").unwrap().fallback.is_none());
    let err = config.endpoint("videos").unwrap_err().to_string();
    assert!(err.contains("jobs, papers"));
  }

  #[test]
  fn test_backoff_setting() {
    let config = Config::parse("provider:\n  reenable:\n    mode: backoff\n    base_secs: 5\n    max_secs: 50\n").unwrap();

    assert_eq!(
      ProviderConfig::from(&config.provider).reenable,
      ReenablePolicy::Backoff {
        base: chrono::Duration::seconds(5),
        max: chrono::Duration::seconds(50),
      }
    );
  }

  #[test]
  fn test_missing_explicit_path() {
    assert!(Config::load(Some(Path::new("/definitely/not/here.yaml"))).is_err());
  }
}
