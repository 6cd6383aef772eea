use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{Map, Value};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use epicare_sync::app::App;
use epicare_sync::client::WriteOutcome;
use epicare_sync::config::Config;
use epicare_sync::logging;
use epicare_sync::worker::ClientMessage;

#[derive(Parser, Debug)]
#[command(name = "epicare-sync")]
#[command(about = "Offline write queue and sync worker for the Epicare backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/epicare-sync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the background worker, reading JSON-line commands from stdin
  Run,
  /// Drain the queue once
  Sync,
  /// Print the queue status
  Status,
  /// Submit a write, queuing it if the service is unreachable
  Send {
    /// Action name, e.g. addFollowUp
    action: String,
    /// JSON object with the action's fields
    #[arg(long, default_value = "{}")]
    data: String,
    /// Also keep an offline record of this type while queued
    #[arg(long)]
    record_type: Option<String>,
  },
  /// Evaluate a subject's context against the rule engine
  Evaluate {
    subject_id: String,
    /// JSON object with the subject's context
    #[arg(long)]
    context: String,
  },
  /// Show or update the service configuration
  Config {
    /// JSON object to store as the new configuration
    #[arg(long)]
    set: Option<String>,
    /// Show knowledge-base metadata instead
    #[arg(long, conflicts_with = "set")]
    metadata: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  let app = App::new(config)?;

  match args.command {
    Command::Run => run(&app).await,
    Command::Sync => {
      let mut events = app.notifier.subscribe();
      let report = app.processor.drain().await?;
      while let Ok(event) = events.try_recv() {
        print_json(&event)?;
      }
      info!(?report, "Sync finished");
      print_json(&report)
    }
    Command::Status => print_json(&app.processor.status()?),
    Command::Send {
      action,
      data,
      record_type,
    } => {
      let data = parse_object(&data)?;
      let outcome = match record_type {
        Some(record_type) => {
          app
            .client
            .submit_write_with_record(&action, &data, &record_type)
            .await?
        }
        None => app.client.submit_write(&action, &data).await?,
      };
      match outcome {
        WriteOutcome::Delivered(envelope) => print_json(&envelope),
        WriteOutcome::Queued { id } => {
          print_json(&serde_json::json!({"status": "queued", "id": id}))
        }
        WriteOutcome::Lost => Err(eyre!("Write could not be delivered or queued")),
      }
    }
    Command::Evaluate {
      subject_id,
      context,
    } => {
      let context: Value =
        serde_json::from_str(&context).map_err(|e| eyre!("Invalid --context JSON: {}", e))?;
      print_json(&app.client.evaluate(&subject_id, &context).await)
    }
    Command::Config { set, metadata } => {
      if let Some(set) = set {
        let value: Value =
          serde_json::from_str(&set).map_err(|e| eyre!("Invalid --set JSON: {}", e))?;
        print_json(&app.client.set_config(&value).await?)
      } else if metadata {
        let metadata = app.client.knowledge_base_metadata().await;
        print_json(&metadata.ok_or_else(|| eyre!("Failed to fetch knowledge-base metadata"))?)
      } else {
        let config = app.client.get_config().await;
        print_json(&config.ok_or_else(|| eyre!("Failed to fetch configuration"))?)
      }
    }
  }
}

/// Worker loop: stdin lines in, events and status snapshots out.
async fn run(app: &App) -> Result<()> {
  let (worker, handle) = app.worker();
  let mut events = app.notifier.subscribe();
  let worker_task = tokio::spawn(worker.run());

  // Pick up anything left over from a previous run
  handle.sync_now()?;

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  loop {
    tokio::select! {
      line = lines.next_line() => {
        let Some(line) = line? else {
          break;
        };
        if line.trim().is_empty() {
          continue;
        }
        match ClientMessage::parse(&line) {
          Ok(message) => {
            if let Some(status) = handle.dispatch(message).await? {
              print_json(&status)?;
            }
          }
          Err(e) => warn!("{}", e),
        }
      }
      event = events.recv() => match event {
        Ok(event) => print_json(&event)?,
        Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event output fell behind"),
        Err(RecvError::Closed) => break,
      },
    }
  }

  info!("Input closed, stopping worker");
  drop(handle);
  worker_task.await?;
  while let Ok(event) = events.try_recv() {
    print_json(&event)?;
  }
  Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string(value)?);
  Ok(())
}

fn parse_object(raw: &str) -> Result<Map<String, Value>> {
  match serde_json::from_str(raw) {
    Ok(Value::Object(map)) => Ok(map),
    Ok(_) => Err(eyre!("--data must be a JSON object")),
    Err(e) => Err(eyre!("Invalid --data JSON: {}", e)),
  }
}
