//! Eaves CLI - Inspect and maintain a client data directory.
//!
//! This tool operates on the files a client keeps on disk: the pinning
//! datastore, the command journal and the stored configuration. It never
//! talks to the remote store.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

use eaves_common::{LocalId, ObjectRef};
use eaves_model::config::{CONFIG_FILENAME, DATASTORE_FILENAME, JOURNAL_FILENAME};
use eaves_model::{ClientConfig, ObjectStore};
use eaves_storage::LocalStore;
use eaves_sync::{CommandKind, CommandQueue, PinningDatastore, QueuedCommand};

#[derive(Parser)]
#[command(name = "eaves")]
#[command(about = "Eaves - Offline-first client data maintenance")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Client data directory.
    #[arg(short, long, global = true, default_value = ".eaves")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the stored client configuration.
    Config,

    /// List pins with their member counts.
    Pins,

    /// Print a pinned object.
    Show {
        /// Class name.
        #[arg(short, long)]
        class: String,

        /// Object id, or `local:<uuid>` for an unsaved object.
        #[arg(short, long)]
        key: String,
    },

    /// Remove every member of a pin.
    Unpin {
        /// Pin name.
        #[arg(short, long)]
        pin: String,
    },

    /// List queued and failed commands.
    Queue {
        /// Print the commands as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Acknowledge a failed command, removing it from the journal.
    Ack {
        /// Command id.
        #[arg(short, long)]
        id: Uuid,
    },

    /// Check the datastore for partially applied writes.
    Verify,

    /// Drop stored objects no pin refers to.
    Compact,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let dir = cli.data_dir.as_path();
    match cli.command {
        Commands::Config => cmd_config(dir).await,
        Commands::Pins => cmd_pins(dir),
        Commands::Show { class, key } => cmd_show(dir, &class, &key),
        Commands::Unpin { pin } => cmd_unpin(dir, &pin),
        Commands::Queue { json } => cmd_queue(dir, json).await,
        Commands::Ack { id } => cmd_ack(dir, id).await,
        Commands::Verify => cmd_verify(dir),
        Commands::Compact => cmd_compact(dir),
    }
}

fn open_datastore(dir: &Path) -> Result<PinningDatastore> {
    let path = dir.join(DATASTORE_FILENAME);
    if !path.exists() {
        anyhow::bail!("No datastore at {}", path.display());
    }
    let local = LocalStore::open(&path).context("Failed to open datastore")?;
    Ok(PinningDatastore::new(local, Arc::new(ObjectStore::default())))
}

async fn open_queue(dir: &Path) -> Result<CommandQueue> {
    let path = dir.join(JOURNAL_FILENAME);
    if !path.exists() {
        anyhow::bail!("No command journal at {}", path.display());
    }
    CommandQueue::open(&path)
        .await
        .context("Failed to open command journal")
}

fn parse_ref(class: &str, key: &str) -> Result<ObjectRef> {
    match key.strip_prefix("local:") {
        Some(local) => {
            let local_id = LocalId::parse(local).context("Invalid local id")?;
            Ok(ObjectRef::unsaved(class, local_id))
        }
        None => Ok(ObjectRef::saved(class, key)),
    }
}

/// Show the stored configuration.
async fn cmd_config(dir: &Path) -> Result<()> {
    let path = dir.join(CONFIG_FILENAME);
    let json = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config = ClientConfig::from_json(&json).context("Invalid configuration")?;

    println!("Client configuration:");
    println!("  Server: {}", config.server);
    println!("  Application: {}", config.application_id);
    println!(
        "  Local datastore: {}",
        if config.local_datastore_enabled { "enabled" } else { "disabled" }
    );
    println!("  Default pin: {}", config.default_pin_name);
    println!("  Network retries: {}", config.network_retry_attempts);
    println!("  Request timeout: {:?}", config.request_timeout());
    println!(
        "  Queue backoff: {:?} .. {:?}",
        config.queue_retry.initial_backoff(),
        config.queue_retry.max_backoff()
    );
    println!("  Local ACL checks: {}", config.local_acl_checks);
    Ok(())
}

/// List pins.
fn cmd_pins(dir: &Path) -> Result<()> {
    let datastore = open_datastore(dir)?;
    let pins = datastore.pins().context("Failed to list pins")?;

    if pins.is_empty() {
        println!("No pins.");
    } else {
        println!("{:<24} {:>8} {:>8}", "PIN", "MEMBERS", "CONTENT");
        for pin in pins {
            println!(
                "{:<24} {:>8} {:>8}",
                pin.pin_name, pin.members, pin.with_content
            );
        }
    }
    Ok(())
}

/// Print one pinned object.
fn cmd_show(dir: &Path, class: &str, key: &str) -> Result<()> {
    let object_ref = parse_ref(class, key)?;
    let datastore = open_datastore(dir)?;
    let record = datastore
        .fetch_record(&object_ref)
        .with_context(|| format!("{} is not available locally", object_ref))?;

    let json = serde_json::to_string_pretty(&record)?;
    println!("{}", json);
    Ok(())
}

/// Empty a pin.
fn cmd_unpin(dir: &Path, pin: &str) -> Result<()> {
    let datastore = open_datastore(dir)?;
    let removed = datastore.unpin_all(pin).context("Failed to unpin")?;
    info!("Removed {} members from pin '{}'", removed, pin);
    println!("Removed {} members from '{}'.", removed, pin);
    Ok(())
}

fn describe(command: &QueuedCommand) -> String {
    let action = match &command.kind {
        CommandKind::Save { delta } => {
            let keys: Vec<&str> = delta.changes.keys().map(String::as_str).collect();
            if delta.acl.is_some() {
                format!("save [{}] +ACL", keys.join(", "))
            } else {
                format!("save [{}]", keys.join(", "))
            }
        }
        CommandKind::Delete => "delete".to_string(),
    };
    format!("#{} {} {} {}", command.seq, command.id, command.target, action)
}

/// List queued and failed commands.
async fn cmd_queue(dir: &Path, json: bool) -> Result<()> {
    let queue = open_queue(dir).await?;
    let pending = queue.pending();

    if json {
        let doc = serde_json::json!({
            "pending": pending,
            "failed": queue.failed(),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    if pending.is_empty() {
        println!("No queued commands.");
    } else {
        println!("Queued ({}):", pending.len());
        let now = Utc::now();
        for command in &pending {
            let wait = match command.not_before {
                Some(t) if t > now => format!(", retry in {}s", (t - now).num_seconds()),
                _ => String::new(),
            };
            println!(
                "  {} ({} attempts{})",
                describe(command),
                command.attempts,
                wait
            );
        }
    }

    if !queue.failed().is_empty() {
        println!("Failed ({}):", queue.failed().len());
        for command in queue.failed() {
            println!(
                "  {} [code {}] {}",
                describe(command),
                command.error_code.unwrap_or_default(),
                command.last_error.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

/// Acknowledge a failed command.
async fn cmd_ack(dir: &Path, id: Uuid) -> Result<()> {
    let mut queue = open_queue(dir).await?;
    match queue.acknowledge(id).await? {
        Some(command) => println!("Acknowledged {}", describe(&command)),
        None => anyhow::bail!("No failed command with id {}", id),
    }
    Ok(())
}

/// Check datastore integrity.
fn cmd_verify(dir: &Path) -> Result<()> {
    let datastore = open_datastore(dir)?;
    let report = datastore.verify().context("Datastore integrity check failed")?;

    println!("Datastore is consistent.");
    println!("  Pins: {}", report.pins_checked);
    println!("  Memberships: {}", report.memberships_checked);
    println!("  Objects: {}", report.objects_checked);
    Ok(())
}

/// Compact the datastore.
fn cmd_compact(dir: &Path) -> Result<()> {
    let datastore = open_datastore(dir)?;
    let removed = datastore.compact().context("Failed to compact datastore")?;
    println!("Removed {} unreferenced objects.", removed);
    Ok(())
}
