use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Url;
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use hoard::config::Config;
use hoard::logging;
use hoard::message::ProxyMessage;
use hoard::proxy::ProxyRequest;
use hoard::store::Record;
use hoard::Runtime;

#[derive(Parser, Debug)]
#[command(name = "hoard")]
#[command(about = "Offline-tolerant local data layer with a durable sync queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/hoard/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Create or update a record from a JSON object
  Put {
    collection: String,
    json: String,
    /// Local id of the record to update
    #[arg(long)]
    id: Option<String>,
  },
  /// Delete a record by local id
  Delete { local_id: String },
  /// List the live records of a collection
  List { collection: String },
  /// Show the sync queue
  Queue,
  /// Drain the sync queue now
  Sync,
  /// Move a failed entry back to pending
  Retry { id: i64 },
  /// Drop a queue entry, and the record if nothing else references it
  Discard { id: i64 },
  /// Send a GET through the caching proxy
  Fetch {
    /// Absolute URL, or a path relative to the proxy origin
    url: String,
    /// Treat as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Activate a waiting cache generation
  Activate,
  /// Clear the response cache of the active generation
  ClearCache,
  /// Show durability, connectivity and queue state
  Status,
  /// Read JSON messages from stdin and forward them to the background worker
  Serve,
}

#[derive(Serialize)]
struct Status {
  offline_durability: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  storage_error: Option<String>,
  online: bool,
  generation: String,
  proxy_state: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pending: Option<usize>,
  #[serde(skip_serializing_if = "Option::is_none")]
  failed: Option<usize>,
  #[serde(skip_serializing_if = "Option::is_none")]
  last_drain_at: Option<String>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(logging::default_log_dir().as_deref())?;

  let config = Config::load(args.config.as_deref())?;
  let runtime = Runtime::start(&config)?;
  let result = run(&runtime, &config, args.command).await;
  runtime.shutdown().await;
  result
}

async fn run(runtime: &Runtime, config: &Config, command: Command) -> Result<()> {
  let client = runtime.client();

  match command {
    Command::Put {
      collection,
      json,
      id,
    } => {
      let fields: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| eyre!("Invalid JSON: {}", e))?;
      if !fields.is_object() {
        return Err(eyre!("Record fields must be a JSON object"));
      }
      let mut record = match &id {
        Some(id) => match client.get(id)? {
          Some(existing) => existing,
          None => Record::new(&collection, fields.clone()).with_local_id(id),
        },
        None => Record::new(&collection, fields.clone()),
      };
      if record.collection != collection {
        return Err(eyre!(
          "Record {} belongs to {}, not {}",
          record.local_id,
          record.collection,
          collection
        ));
      }
      record.fields = fields;
      let saved = client.save(record).await?;
      print_json(&saved)?;
    }
    Command::Delete { local_id } => {
      let record = client
        .get(&local_id)?
        .ok_or_else(|| eyre!("No record {}", local_id))?;
      client.remove(&record).await?;
      println!("deleted {}", local_id);
    }
    Command::List { collection } => {
      print_json(&client.list(&collection)?)?;
    }
    Command::Queue => {
      print_json(&client.queue_entries()?)?;
    }
    Command::Sync => match client.sync_now().await? {
      Some(report) => println!("{}", report),
      None => println!("a drain is already running"),
    },
    Command::Retry { id } => {
      client.retry(id)?;
      println!("entry {} pending again", id);
    }
    Command::Discard { id } => {
      let outcome = client.discard(id)?;
      println!(
        "removed {} entries{}",
        outcome.entries_removed,
        if outcome.record_removed {
          " and the local record"
        } else {
          ""
        }
      );
    }
    Command::Fetch { url, navigate } => {
      let url = resolve_url(config.proxy_origin(), &url)?;
      let request = if navigate {
        ProxyRequest::navigate(url)
      } else {
        ProxyRequest::get(url)
      };
      let response = runtime.fetch(request).await;
      eprintln!(
        "{} ({:?}, {:?})",
        response.response.status, response.strategy, response.source
      );
      println!("{}", String::from_utf8_lossy(&response.response.body));
    }
    Command::Activate => {
      let swept = runtime.proxy().activate();
      println!(
        "generation {} active, {} stale entries removed",
        runtime.proxy().generation(),
        swept
      );
    }
    Command::ClearCache => {
      let removed = runtime.proxy().clear_cache();
      println!("{} cached responses removed", removed);
    }
    Command::Status => {
      let caps = client.capabilities();
      let durable = caps.offline_durability;
      let status = Status {
        offline_durability: caps.offline_durability,
        storage_error: caps.storage_error,
        online: client.is_online(),
        generation: runtime.proxy().generation().to_string(),
        proxy_state: format!("{:?}", runtime.proxy().state()),
        pending: durable.then(|| client.pending_count()).transpose()?,
        failed: durable
          .then(|| client.failed_entries().map(|f| f.len()))
          .transpose()?,
        last_drain_at: if durable {
          client.last_drain_at()?
        } else {
          None
        },
      };
      print_json(&status)?;
    }
    Command::Serve => serve(runtime).await?,
  }

  Ok(())
}

/// Forward one JSON message per stdin line until EOF.
async fn serve(runtime: &Runtime) -> Result<()> {
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  while let Some(line) = lines.next_line().await? {
    let line = line.trim();
    if line.is_empty() {
      continue;
    }
    match serde_json::from_str::<ProxyMessage>(line) {
      Ok(msg) => runtime.signal(msg),
      Err(e) => warn!(error = %e, "ignoring malformed message"),
    }
  }
  Ok(())
}

fn resolve_url(origin: &str, url: &str) -> Result<Url> {
  match Url::parse(url) {
    Ok(url) => Ok(url),
    Err(url::ParseError::RelativeUrlWithoutBase) => {
      let base =
        Url::parse(origin).map_err(|e| eyre!("Invalid proxy origin {}: {}", origin, e))?;
      base
        .join(url)
        .map_err(|e| eyre!("Invalid URL {}: {}", url, e))
    }
    Err(e) => Err(eyre!("Invalid URL {}: {}", url, e)),
  }
}
