use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use rentsync::admin::{InvalidationOperation, InvalidationRequest};
use rentsync::{CacheResult, Config, OfflineContext, Operation, ResourceKind};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rentsync")]
#[command(about = "Offline-first client for the rental bookkeeping API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rentsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// API base URL, overriding the config file
  #[arg(long)]
  api_url: Option<String>,

  /// Offline database path, overriding the config file
  #[arg(long)]
  db: Option<PathBuf>,

  /// Skip the network: reads come from local data, writes are queued
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List every record of a resource
  List { resource: ResourceKind },

  /// Show one record
  Get { resource: ResourceKind, id: String },

  /// Create a record from a JSON object
  Create {
    resource: ResourceKind,
    #[arg(long)]
    json: String,
  },

  /// Update a record with the fields of a JSON object
  Update {
    resource: ResourceKind,
    id: String,
    #[arg(long)]
    json: String,
  },

  /// Delete a record
  Delete { resource: ResourceKind, id: String },

  /// Replay pending operations against the API
  Sync,

  /// Pending operations and cache health
  Status,

  /// Cache administration
  Cache {
    #[command(subcommand)]
    command: CacheCommand,
  },

  /// Pending-operation queue maintenance
  Queue {
    #[command(subcommand)]
    command: QueueCommand,
  },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// Hit rates and sizes of both cache tiers
  Metrics,
  /// Invalidate the caches affected by a write
  Invalidate {
    /// Resource type or `dashboard`
    #[arg(long = "type")]
    resource_type: String,
    #[arg(long, value_enum, default_value_t = Operation::Update)]
    action: Operation,
  },
  /// Drop every cache entry
  Clear,
  /// Remove expired local entries
  Cleanup,
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Show every queued operation
  List {
    /// Include operations that already synced
    #[arg(long)]
    all: bool,
  },
  /// Make an operation that hit the retry cap eligible again
  Retry { id: i64 },
  /// Drop an operation without replaying it
  Discard { id: i64 },
  /// Delete operations that already synced
  Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(url) = args.api_url {
    config.api.base_url = url;
  }
  if let Some(db) = args.db {
    config.storage.path = Some(db);
  }

  let _log_guard = rentsync::logging::init(&config.logging)?;

  let ctx = OfflineContext::from_config(&config)?;
  if args.offline {
    ctx.set_online(false);
  }

  run(&ctx, args.command).await
}

async fn run(ctx: &OfflineContext, command: Command) -> Result<()> {
  let services = ctx.services();

  match command {
    Command::List { resource } => print_result(ctx.resource(resource).list().await),
    Command::Get { resource, id } => {
      let result = ctx.resource(resource).get(&id).await;
      if result.data.is_none() {
        return Err(eyre!("{} {} not found", resource, id));
      }
      print_result(result)
    }
    Command::Create { resource, json } => {
      let data = parse_record(&json)?;
      print_result(ctx.resource(resource).create(data).await?)
    }
    Command::Update { resource, id, json } => {
      let data = parse_record(&json)?;
      print_result(ctx.resource(resource).update(&id, data).await?)
    }
    Command::Delete { resource, id } => print_result(ctx.resource(resource).delete(&id).await?),
    Command::Sync => {
      let result = ctx.sync_now().await;
      print_json(&result)?;
      if !result.success {
        return Err(eyre!("Sync finished with {} failure(s)", result.failed));
      }
      Ok(())
    }
    Command::Status => {
      let status = ctx.pending_status()?;
      let admin = ctx.admin();
      print_json(&json!({
        "pending": status.pending,
        "needsResolution": status.needs_resolution,
        "online": services.connectivity.is_online(),
        "cache": admin.metrics(),
      }))
    }
    Command::Cache { command } => {
      let admin = ctx.admin();
      match command {
        CacheCommand::Metrics => {
          let metrics = admin.metrics();
          eprintln!("client: {}", metrics.metrics.client.display());
          eprintln!("server: {}", metrics.metrics.server.display());
          print_json(&metrics)
        }
        CacheCommand::Invalidate {
          resource_type,
          action,
        } => {
          let request = InvalidationRequest {
            operation: InvalidationOperation {
              resource_type,
              action,
            },
          };
          print_json(&admin.invalidate(&request).await?)
        }
        CacheCommand::Clear => {
          admin.clear()?;
          println!("Caches cleared");
          Ok(())
        }
        CacheCommand::Cleanup => {
          println!("Removed {} expired entries", admin.cleanup()?);
          Ok(())
        }
      }
    }
    Command::Queue { command } => match command {
      QueueCommand::List { all } => {
        let ops = if all {
          services.queue.list_all()?
        } else {
          services.queue.list_unsynced()?
        };
        print_json(&ops)
      }
      QueueCommand::Retry { id } => {
        services.queue.retry(id)?;
        println!("Operation {} will be retried on the next sync", id);
        Ok(())
      }
      QueueCommand::Discard { id } => {
        services.queue.discard(id)?;
        println!("Operation {} discarded", id);
        Ok(())
      }
      QueueCommand::Prune => {
        println!("Pruned {} synced operations", services.queue.prune_synced()?);
        Ok(())
      }
    },
  }
}

fn parse_record(raw: &str) -> Result<Value> {
  let value: Value = serde_json::from_str(raw).map_err(|e| eyre!("Invalid JSON: {}", e))?;
  if !value.is_object() {
    return Err(eyre!("Record must be a JSON object"));
  }
  Ok(value)
}

fn print_result<T: Serialize>(result: CacheResult<T>) -> Result<()> {
  print_json(&json!({
    "source": result.source,
    "cachedAt": result.cached_at,
    "data": result.data,
  }))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
