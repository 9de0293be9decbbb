use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LogSettings;

/// Environment variable that overrides the configured filter.
pub const LOG_ENV: &str = "STRATA_LOG";

/// Log to a daily rolling file under `log_dir`.
///
/// Keep the returned guard alive for the life of the process, dropping it
/// flushes buffered lines.
pub fn init(settings: &LogSettings, log_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let filter = EnvFilter::try_from_env(LOG_ENV)
    .or_else(|_| EnvFilter::try_new(&settings.filter))
    .map_err(|e| eyre!("Invalid log filter '{}': {}", settings.filter, e))?;

  let appender = tracing_appender::rolling::daily(log_dir, "strata.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}
