mod cache;
mod clock;
mod config;
mod connectivity;
mod kpi;
mod logging;
mod query;
mod remote;
mod session;

use cache::{CacheLayer, CacheResult, FetchRequest, LocalStore, NoopStorage, SqliteStorage};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use config::Config;
use connectivity::{Connectivity, Probe};
use kpi::{KpiAggregator, KpiView, DASHBOARD_KPI_KEY};
use query::{Query, QueryState};
use remote::{RefreshTokenSource, RemoteClient};
use serde_json::{json, Value};
use session::SessionGuard;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "lpgcache")]
#[command(about = "Offline-aware cache and dashboard loader for LPG retail backends")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/lpgcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Treat the backend as unreachable and serve only cached data
  #[arg(long, global = true)]
  offline: bool,

  /// Mirror logs to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Load the dashboard KPI snapshot
  Kpi,
  /// Keep the dashboard fresh, reloading on reconnect and every interval
  Watch {
    /// Seconds between reloads
    #[arg(long, default_value_t = 60)]
    every: u64,
  },
  /// Call a remote procedure through the cache
  Fetch {
    /// RPC function name
    function: String,
    /// Cache key for the result
    #[arg(short, long)]
    key: String,
    /// Mirror array results into this collection
    #[arg(long)]
    collection: Option<String>,
    /// JSON parameters (defaults to the business id)
    #[arg(long)]
    params: Option<String>,
    /// JSON value to return when offline with nothing cached
    #[arg(long)]
    fallback: Option<String>,
    /// Extra attempts after a failed call
    #[arg(long, default_value_t = 1)]
    retry: u32,
    /// Keep running and refetch once the result is this many seconds old
    #[arg(long)]
    every: Option<u64>,
  },
  /// Print a cached value
  Show {
    /// Cache key to look up
    key: String,
  },
  /// Refresh the signed-in session
  Session,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.verbose)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  if config.cache.enabled {
    let storage = match &config.cache.path {
      Some(path) => SqliteStorage::open(path)?,
      None => SqliteStorage::open_default()?,
    };
    run(args, config, Arc::new(storage)).await
  } else {
    run(args, config, Arc::new(NoopStorage)).await
  }
}

async fn run<S: LocalStore>(args: Args, config: Config, store: Arc<S>) -> Result<()> {
  match args.command {
    Command::Show { key } => show(store.as_ref(), &key).await,
    Command::Kpi => {
      let (client, connectivity) = connect(&config, store.as_ref(), args.offline).await?;
      let aggregator = dashboard(&config, store, client, connectivity);
      print_view(&aggregator.load().await)
    }
    Command::Watch { every } => {
      let (client, connectivity) = connect(&config, store.as_ref(), args.offline).await?;
      if !args.offline {
        let interval = Duration::from_secs(config.connectivity.probe_interval_secs.max(1));
        connectivity::spawn_probe(connectivity.clone(), client.clone(), interval);
      }
      let aggregator = Arc::new(dashboard(&config, store, client, connectivity));
      aggregator.spawn_reconnect_refresh();

      let mut ticker = tokio::time::interval(Duration::from_secs(every.max(1)));
      loop {
        tokio::select! {
          _ = ticker.tick() => print_view(&aggregator.load().await)?,
          _ = tokio::signal::ctrl_c() => return Ok(()),
        }
      }
    }
    Command::Fetch {
      function,
      key,
      collection,
      params,
      fallback,
      retry,
      every,
    } => {
      let (client, connectivity) = connect(&config, store.as_ref(), args.offline).await?;
      let params = match params {
        Some(raw) => parse_json("--params", &raw)?,
        None => client.business_params(),
      };
      let fallback = fallback
        .map(|raw| parse_json("--fallback", &raw))
        .transpose()?;
      let layer = CacheLayer::from_shared(store, connectivity.clone());
      let stale_time = chrono::Duration::seconds(config.cache.stale_time_secs as i64);

      let mut query = Query::new(move || {
        let layer = layer.clone();
        let client = client.clone();
        let function = function.clone();
        let params = params.clone();
        let mut request = FetchRequest::new(key.clone()).stale_time(stale_time);
        if let Some(collection) = &collection {
          request = request.collection(collection.clone());
        }
        if let Some(fallback) = &fallback {
          request = request.fallback(fallback.clone());
        }
        async move {
          // Arrays are mirrored into the collection, anything else only cached
          layer
            .fetch_list(request, || client.rpc(&function, &params))
            .await
            .map_err(|e| e.to_string())
        }
      })
      .with_retry(retry)
      .with_connectivity(connectivity);

      query.fetch();
      if let QueryState::Error(e) = query.settle().await {
        return Err(eyre!("{}", e));
      }
      report(&query)?;

      let Some(every) = every else {
        return Ok(());
      };
      let stale_after = Duration::from_secs(every.max(1));
      let mut query = query.with_stale_time(stale_after);
      let mut ticker = tokio::time::interval(Duration::from_millis(250));
      // Failed results are never stale, so retry them on their own schedule
      let mut retry_ticker = tokio::time::interval(stale_after);
      retry_ticker.reset();
      loop {
        tokio::select! {
          _ = ticker.tick() => {
            if query.poll() {
              report(&query)?;
            }
            if query.is_stale() && !query.is_loading() {
              query.refetch();
            }
          }
          _ = retry_ticker.tick() => {
            if query.error().is_some() {
              query.refetch();
            }
          }
          _ = tokio::signal::ctrl_c() => return Ok(()),
        }
      }
    }
    Command::Session => {
      // The refresh call authenticates with the api key alone
      let (client, _) = connect(&config, &NoopStorage, args.offline).await?;
      let source = RefreshTokenSource::new(client, Config::get_refresh_token()?);
      let guard =
        SessionGuard::new(store, source).with_max_attempts(config.session.max_attempts);
      let outcome = guard.get_session().await?;

      let output = json!({
        "user_id": outcome.session.user_id,
        "token": outcome.session.fingerprint(),
        "expires_at": outcome.session.expires_at,
        "from_cache": outcome.from_cache,
      });
      println!("{}", serde_json::to_string_pretty(&output)?);
      Ok(())
    }
  }
}

/// Build the backend client and take an initial connectivity reading.
///
/// Calls run as the signed-in user when `store` holds an unexpired session.
async fn connect<S: LocalStore>(
  config: &Config,
  store: &S,
  offline: bool,
) -> Result<(RemoteClient, Connectivity)> {
  let mut client = RemoteClient::new(&config.backend, Config::get_api_key()?)?;
  if let Some(session) = session::stored_session(store).await {
    info!(token = %session.fingerprint(), "using stored session");
    client = client.with_access_token(session.access_token);
  }
  let connectivity = if offline {
    Connectivity::new(false)
  } else {
    Connectivity::new(client.is_reachable().await)
  };
  info!(online = connectivity.is_online(), "connected");
  Ok((client, connectivity))
}

fn dashboard<S: LocalStore>(
  config: &Config,
  store: Arc<S>,
  client: RemoteClient,
  connectivity: Connectivity,
) -> KpiAggregator<S, RemoteClient> {
  let key = match &config.backend.business_id {
    Some(id) => format!("{}:{}", DASHBOARD_KPI_KEY, id),
    None => DASHBOARD_KPI_KEY.to_string(),
  };

  KpiAggregator::new(store, client, connectivity)
    .with_key(key)
    .with_ttl(chrono::Duration::seconds(config.cache.kpi_ttl_secs as i64))
    .with_debounce(chrono::Duration::milliseconds(config.cache.kpi_debounce_ms as i64))
}

async fn show<S: LocalStore>(store: &S, key: &str) -> Result<()> {
  let record = store
    .get_meta::<Value>(key)
    .await
    .map_err(|e| eyre!("Failed to read cache: {}", e))?
    .ok_or_else(|| eyre!("Nothing cached under '{}'", key))?;

  let output = json!({
    "key": record.key,
    "stored_at": record.stored_at,
    "data": record.value,
  });
  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}

fn print_view(view: &KpiView) -> Result<()> {
  let output = json!({
    "source": if view.is_from_cache { "cache" } else { "network" },
    "warning": view.warning,
    "snapshot": view.snapshot,
  });
  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}

fn parse_json(flag: &str, raw: &str) -> Result<Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Invalid {} JSON: {}", flag, e))
}

/// Print the latest result, or the error when the last fetch failed.
fn report(query: &Query<CacheResult<Value>>) -> Result<()> {
  if let Some(e) = query.error() {
    eprintln!("fetch failed: {}", e);
    return Ok(());
  }
  match query.data() {
    Some(result) => print_result(result),
    None => Ok(()),
  }
}

fn print_result(result: &CacheResult<Value>) -> Result<()> {
  let output = json!({
    "source": result.source.as_str(),
    "from_cache": result.is_from_cache(),
    "cached_at": result.cached_at,
    "data": result.data,
  });
  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}
