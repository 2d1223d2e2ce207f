//! Rewind - command line entry point
//!
//! Backs up platform objects to a local directory and restores them into a
//! target environment in dependency order.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rewind_engine::backup::{BackupRequest, ObjectSelection};
use rewind_engine::engine::Outcome;
use rewind_engine::events::{EngineEvent, ProgressPayload};
use rewind_engine::restore::RestoreRequest;
use rewind_engine::{config::Config, utils, JobHandle, MigrationEngine};
use serde::Serialize;
use std::fmt::Debug;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "rewind", author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export objects from the source environment
    Backup {
        /// Object to export, optionally with fields: `Account` or `Account:Name,Industry`
        #[arg(short, long = "object", value_name = "OBJECT", required = true)]
        objects: Vec<String>,

        /// Backup id (defaults to a timestamp)
        #[arg(short, long)]
        name: Option<String>,

        /// Parent directory for the backup (overrides config)
        #[arg(short, long, value_name = "DIR")]
        destination: Option<PathBuf>,
    },

    /// Replay a backup into the target environment
    Restore {
        /// Backup directory containing manifest.json
        backup_dir: PathBuf,

        /// Continue from the checkpoint of an interrupted restore
        #[arg(long)]
        resume: bool,
    },

    /// Show the restore order and schema drops without writing anything
    Plan {
        /// Backup directory containing manifest.json
        backup_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting rewind v{}", env!("CARGO_PKG_VERSION"));

    let backup_root = config.storage.backup_dir.clone();
    let engine = MigrationEngine::from_config(config)?;
    spawn_event_reporter(&engine);

    match args.command {
        Command::Backup {
            objects,
            name,
            destination,
        } => {
            let objects = objects
                .iter()
                .map(|spec| parse_selection(spec))
                .collect::<Result<Vec<_>>>()?;
            let request = BackupRequest {
                objects,
                destination: destination.unwrap_or(backup_root),
                name,
            };
            let handle = engine.start_backup(request)?;
            finish(handle).await
        }
        Command::Restore { backup_dir, resume } => {
            let handle = engine.start_restore(RestoreRequest { backup_dir, resume })?;
            finish(handle).await
        }
        Command::Plan { backup_dir } => {
            let plan = engine.plan_restore(&backup_dir).await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
    }
}

/// `Account` or `Account:Name,Industry`.
fn parse_selection(spec: &str) -> Result<ObjectSelection> {
    match spec.split_once(':') {
        None if !spec.trim().is_empty() => Ok(ObjectSelection::all(spec.trim())),
        Some((object, fields)) if !object.trim().is_empty() => {
            let fields: Vec<&str> = fields
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .collect();
            if fields.is_empty() {
                bail!("no fields listed for {}", object);
            }
            Ok(ObjectSelection::with_fields(object.trim(), fields))
        }
        _ => bail!("invalid object selection {:?}", spec),
    }
}

/// Wait for a job, cancelling it on Ctrl-C, and print its summary.
async fn finish<S>(handle: JobHandle<S>) -> Result<()>
where
    S: Serialize + Debug + Send + Sync + 'static,
{
    let token = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next batch boundary");
            token.cancel();
        }
    });

    let outcome: Outcome<S> = handle.join().await?;
    match outcome {
        Ok(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Err(aborted) => {
            println!("{}", serde_json::to_string_pretty(&aborted.partial)?);
            Err(aborted.into())
        }
    }
}

fn spawn_event_reporter(engine: &MigrationEngine) {
    let mut rx = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => report(&event),
                Err(RecvError::Lagged(n)) => warn!("Event reporter lagged, {} events skipped", n),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn report(event: &EngineEvent) {
    match event {
        EngineEvent::BackupStarted { backup_id, objects } => {
            info!("Backup {} started: {}", backup_id, objects.join(", "))
        }
        EngineEvent::RestoreStarted { backup_id, order, resumed } => info!(
            "Restore of {} started{}: {}",
            backup_id,
            if *resumed { " (resumed)" } else { "" },
            order.join(" -> ")
        ),
        EngineEvent::Progress(ProgressPayload {
            phase,
            object_name,
            records_done,
            records_total,
        }) => match records_total {
            Some(total) => info!("[{:?}] {}: {}/{}", phase, object_name, records_done, total),
            None => info!("[{:?}] {}: {}", phase, object_name, records_done),
        },
        EngineEvent::ObjectCompleted {
            object_name,
            succeeded,
            failed,
            ..
        } => info!("{} done: {} ok, {} failed", object_name, succeeded, failed),
        EngineEvent::FieldDropped {
            object_name,
            field,
            reason,
        } => warn!("{}.{} will not be restored ({})", object_name, field, reason),
        EngineEvent::BackupCompleted {
            backup_id,
            total_records,
            duration_secs,
        } => info!("Backup {} complete: {} records in {}s", backup_id, total_records, duration_secs),
        EngineEvent::RestoreCompleted {
            backup_id,
            imported,
            failed,
            duration_secs,
        } => info!(
            "Restore of {} complete: {} imported, {} failed in {}s",
            backup_id, imported, failed, duration_secs
        ),
        EngineEvent::OperationFailed { phase, error: message } => {
            error!("{:?} failed: {}", phase, message)
        }
    }
}
