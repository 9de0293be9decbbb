use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

use strata::cache::{KeyValueStore, SqliteStore};
use strata::config::{self, Config};
use strata::http::{HttpClient, HttpSyncHandler};
use strata::logging;
use strata::offline::{Connectivity, OfflineDataManager, SyncHandler, SyncQueueItem};
use strata::provider::{ApiSources, DataProvider, FALLBACK_API, PRIMARY_API};

#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(about = "Resilient multi-source data access with an offline write queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/strata/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Behave as if the network were down
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch from a configured endpoint through its fallback chain
  Fetch {
    endpoint: String,
    /// Query params as key=value
    params: Vec<String>,
  },
  /// Read or write the offline value cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
  /// Submit a write, queueing it when it cannot be delivered
  Queue {
    key: String,
    /// JSON payload
    data: String,
  },
  /// Replay queued writes
  Sync,
  /// Show connectivity, cache and queue state
  Status,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  Set {
    key: String,
    /// JSON value
    data: String,
  },
  Get {
    key: String,
    /// Max age in seconds (default from config)
    #[arg(long)]
    max_age: Option<u64>,
  },
}

/// Used when no sync URL is configured, so writes stay queued.
struct NoSyncTarget;

impl SyncHandler for NoSyncTarget {
  fn sync<'a>(&'a self, _item: &'a SyncQueueItem) -> BoxFuture<'a, Result<()>> {
    Box::pin(async { Err(eyre!("No sync URL configured")) })
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let data_dir = config::data_dir()?;
  let _log_guard = logging::init(&config.log, &data_dir.join("logs"))?;

  let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open()?);
  let client = HttpClient::new(&config.http)?;
  let connectivity = Connectivity::new(!args.offline);

  match args.command {
    Command::Fetch { endpoint, params } => {
      fetch(&config, client, store, &endpoint, &params, args.offline).await
    }
    Command::Cache { action } => {
      let manager = offline_manager(&config, client, store, &connectivity)?;
      match action {
        CacheAction::Set { key, data } => manager.cache_data(&key, &parse_json(&data)?),
        CacheAction::Get { key, max_age } => {
          let max_age = max_age.map(|s| chrono::Duration::seconds(s as i64));
          let value: Option<Value> = manager.get_cached_data(&key, max_age)?;
          println!("{}", value.unwrap_or(Value::Null));
          Ok(())
        }
      }
    }
    Command::Queue { key, data } => {
      let manager = offline_manager(&config, client, store, &connectivity)?;
      let outcome = manager.submit(&key, &parse_json(&data)?).await?;
      println!("{:?} ({} pending)", outcome, manager.sync_queue_size());
      Ok(())
    }
    Command::Sync => {
      let manager = offline_manager(&config, client, store, &connectivity)?;
      if !manager.is_currently_online() {
        return Err(eyre!("Cannot sync while offline"));
      }
      let synced = manager.flush_sync_queue().await?;
      println!("Synced {} writes, {} pending", synced, manager.sync_queue_size());
      Ok(())
    }
    Command::Status => {
      let manager = offline_manager(&config, client, store, &connectivity)?;
      println!("online:   {}", manager.is_currently_online());
      println!("cached:   {}", manager.cache_size()?);
      println!("pending:  {}", manager.sync_queue_size());
      Ok(())
    }
  }
}

async fn fetch(
  config: &Config,
  client: HttpClient,
  store: Arc<dyn KeyValueStore>,
  endpoint: &str,
  params: &[String],
  offline: bool,
) -> Result<()> {
  let endpoint_config = config.endpoint(endpoint)?;

  let mut sources = ApiSources::new(client.endpoint_fetcher(&endpoint_config.primary)?).with_store(store);
  if let Some(fallback) = &endpoint_config.fallback {
    sources = sources.with_fallback(client.endpoint_fetcher(fallback)?);
  }

  let provider = DataProvider::new(sources, (&config.provider).into());
  if offline {
    provider.update_source_status(PRIMARY_API, false);
    provider.update_source_status(FALLBACK_API, false);
  }

  let params = parse_params(params)?;
  let result = provider.get(params.as_ref()).await;

  let output =
    serde_json::to_string_pretty(&result).map_err(|e| eyre!("Failed to render result: {}", e))?;
  println!("{}", output);
  Ok(())
}

fn offline_manager(
  config: &Config,
  client: HttpClient,
  store: Arc<dyn KeyValueStore>,
  connectivity: &Connectivity,
) -> Result<OfflineDataManager> {
  let handler: Arc<dyn SyncHandler> = match &config.sync {
    Some(sync) => Arc::new(HttpSyncHandler::new(client, &sync.url)?),
    None => Arc::new(NoSyncTarget),
  };

  Ok(
    OfflineDataManager::new(store, connectivity, handler)?
      .with_default_max_age(config.offline.default_max_age()),
  )
}

fn parse_json(raw: &str) -> Result<Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Invalid JSON '{}': {}", raw, e))
}

/// `key=value` pairs into a JSON object; `None` when there are none.
fn parse_params(pairs: &[String]) -> Result<Option<Value>> {
  if pairs.is_empty() {
    return Ok(None);
  }

  let mut map = Map::new();
  for pair in pairs {
    let (key, value) = pair
      .split_once('=')
      .ok_or_else(|| eyre!("Expected key=value, got '{}'", pair))?;
    map.insert(key.to_string(), Value::String(value.to_string()));
  }
  Ok(Some(Value::Object(map)))
}
